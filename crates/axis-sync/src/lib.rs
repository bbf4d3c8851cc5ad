//! Deadline deduplication + source reconciliation engine.
//!
//! Two read-only query entry points ([`duplicate_groups`],
//! [`merge_suggestions`]) propose merges over a deadline list without ever
//! mutating the store. Three bridges ([`sync_canvas`], [`sync_github`],
//! [`sync_exam_calendar`]) reconcile externally extracted candidates into
//! the store through one shared algorithm, never overwriting a due date the
//! user has taken ownership of.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axis_core::{
    task_looks_exam_like, Deadline, DeadlineCandidate, DeadlinePatch, DeadlineSource, NewDeadline,
    Priority, EXAM_ID_PREFIX, GITHUB_ID_PREFIX,
};
use axis_sources::{
    canvas_candidates, extract_exam_candidates, normalize_course_key, normalize_task_key,
    parse_readme_deadlines, pick_repository, CalendarEvent, CanvasAssignment, GithubClient,
};
use axis_store::{DeadlineStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "axis-sync";

/// Below this task-text similarity two deadlines are never duplicates.
const TASK_SIMILARITY_FLOOR: f64 = 0.45;
/// Composite score a pair must reach for a duplicate verdict.
const DUPLICATE_SCORE_FLOOR: f64 = 0.58;
/// Due dates further apart than this are different deadlines, full stop.
const DUE_WINDOW_DAYS: f64 = 2.0;
/// Mean pairwise score at which a suggestion is tiered "high".
const HIGH_CONFIDENCE_FLOOR: f64 = 0.8;

/// Generic words that carry no identity ("Assignment 1" exists in every
/// course) and are excluded from token overlap.
const TASK_STOP_WORDS: &[&str] = &[
    "assignment",
    "lab",
    "project",
    "task",
    "due",
    "submission",
    "report",
    "part",
    "week",
];

/// Keyword set deciding whether a record is assignment/exam-like enough to
/// deadline-track at all.
const ASSIGNMENT_KEYWORDS: &[&str] = &[
    "assignment",
    "exam",
    "oblig",
    "lab",
    "project",
    "final",
    "eksamen",
    "innlevering",
    "midterm",
    "quiz",
];

/// Pairwise duplicate verdict with diagnostic sub-scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DuplicateSignal {
    pub is_duplicate: bool,
    pub score: f64,
    pub task_score: f64,
    pub due_distance_days: f64,
    pub course_match: bool,
}

fn task_tokens(normalized: &str) -> HashSet<&str> {
    normalized
        .split_whitespace()
        .filter(|t| !TASK_STOP_WORDS.contains(t))
        .collect()
}

/// Task-text similarity in `[0, 1]`: exact normalized match, then substring
/// containment (only when the shorter side is long enough to mean
/// something), then Jaccard overlap of non-stop-word tokens.
pub fn task_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_task_key(a);
    let b = normalize_task_key(b);
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a == b {
        return 1.0;
    }
    let shorter = a.len().min(b.len());
    if shorter >= 8 && (a.contains(&b) || b.contains(&a)) {
        return 0.9;
    }

    let tokens_a = task_tokens(&a);
    let tokens_b = task_tokens(&b);
    let union = tokens_a.union(&tokens_b).count();
    if union == 0 {
        return 0.0;
    }
    tokens_a.intersection(&tokens_b).count() as f64 / union as f64
}

fn due_distance_days(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    (a - b).num_seconds().abs() as f64 / 86_400.0
}

/// Score one pair of deadlines for likely duplication. Course mismatch is
/// an absolute gate; a due-date distance beyond the window vetoes the
/// verdict regardless of how similar the task text is.
pub fn duplicate_signal(a: &Deadline, b: &Deadline) -> DuplicateSignal {
    let key_a = normalize_course_key(&a.course);
    let key_b = normalize_course_key(&b.course);
    let course_match = !key_a.is_empty() && key_a == key_b;
    if !course_match {
        return DuplicateSignal {
            is_duplicate: false,
            score: 0.0,
            task_score: 0.0,
            due_distance_days: due_distance_days(a.due_date, b.due_date),
            course_match: false,
        };
    }

    let task_score = task_similarity(&a.task, &b.task);
    let days = due_distance_days(a.due_date, b.due_date);
    let date_score = (1.0 - days / DUE_WINDOW_DAYS).max(0.0);
    let score = task_score * 0.7 + date_score * 0.3;
    let is_duplicate = days <= DUE_WINDOW_DAYS
        && task_score >= TASK_SIMILARITY_FLOOR
        && score >= DUPLICATE_SCORE_FLOOR;

    DuplicateSignal {
        is_duplicate,
        score,
        task_score,
        due_distance_days: days,
        course_match,
    }
}

/// Array-backed disjoint set with path compression and union by rank.
struct UnionFind {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            Ordering::Less => self.parent[ra] = rb,
            Ordering::Greater => self.parent[rb] = ra,
            Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

fn duplicate_index_groups(deadlines: &[Deadline]) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(deadlines.len());
    for i in 0..deadlines.len() {
        for j in (i + 1)..deadlines.len() {
            if duplicate_signal(&deadlines[i], &deadlines[j]).is_duplicate {
                uf.union(i, j);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = vec![Vec::new(); deadlines.len()];
    for i in 0..deadlines.len() {
        let root = uf.find(i);
        groups[root].push(i);
    }
    groups.retain(|g| g.len() >= 2);
    groups
}

/// Connected component of pairwise-linked duplicates. Size-one components
/// are never reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub member_ids: Vec<String>,
}

/// Transitive closure over all pairwise duplicate verdicts: A~B and B~C put
/// A, B and C in one group even when A and C are not directly similar.
pub fn duplicate_groups(deadlines: &[Deadline]) -> Vec<DuplicateGroup> {
    duplicate_index_groups(deadlines)
        .into_iter()
        .map(|indices| DuplicateGroup {
            member_ids: indices.iter().map(|&i| deadlines[i].id.clone()).collect(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
}

/// Non-destructive merge preview: the union of the best values across the
/// group. Advisory only; nothing applies it automatically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedPreview {
    pub course: String,
    pub task: String,
    pub due_date: DateTime<Utc>,
    pub priority: Priority,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSuggestion {
    pub canonical_id: String,
    pub canonical_source: DeadlineSource,
    pub duplicate_ids: Vec<String>,
    pub confidence: Confidence,
    pub reason: String,
    pub score: f64,
    pub merged_preview: MergedPreview,
}

/// Canonical tie-break: an unfinished record outranks a completed one, then
/// manual beats canvas beats github beats exam, then higher priority, then
/// earlier due date, with the id as the final deterministic tie-break.
fn canonical_order(a: &Deadline, b: &Deadline) -> Ordering {
    a.completed
        .cmp(&b.completed)
        .then_with(|| a.inferred_source().cmp(&b.inferred_source()))
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.due_date.cmp(&b.due_date))
        .then_with(|| a.id.cmp(&b.id))
}

fn merged_preview(canonical: &Deadline, members: &[&Deadline]) -> MergedPreview {
    let due_date = members
        .iter()
        .map(|d| d.due_date)
        .min()
        .unwrap_or(canonical.due_date);
    let priority = members
        .iter()
        .map(|d| d.priority)
        .max()
        .unwrap_or(canonical.priority);
    let completed = members.iter().any(|d| d.completed);
    MergedPreview {
        course: canonical.course.clone(),
        task: canonical.task.clone(),
        due_date,
        priority,
        completed,
    }
}

/// Compute advisory merge suggestions for a deadline list. Pure and
/// side-effect free; safe to call concurrently with bridge runs.
pub fn merge_suggestions(deadlines: &[Deadline]) -> Vec<MergeSuggestion> {
    let mut suggestions: Vec<MergeSuggestion> = duplicate_index_groups(deadlines)
        .into_iter()
        .map(|indices| {
            let mut members: Vec<&Deadline> = indices.iter().map(|&i| &deadlines[i]).collect();
            members.sort_by(|a, b| canonical_order(a, b));
            let canonical = members[0];
            let duplicates = &members[1..];

            let score = duplicates
                .iter()
                .map(|d| duplicate_signal(canonical, d).score)
                .sum::<f64>()
                / duplicates.len() as f64;
            let confidence = if score >= HIGH_CONFIDENCE_FLOOR {
                Confidence::High
            } else {
                Confidence::Medium
            };
            let reason = format!(
                "{} deadlines in {} look like the same task (\"{}\") due within {} days of each other",
                members.len(),
                normalize_course_key(&canonical.course),
                canonical.task,
                DUE_WINDOW_DAYS as i64,
            );

            MergeSuggestion {
                canonical_id: canonical.id.clone(),
                canonical_source: canonical.inferred_source(),
                duplicate_ids: duplicates.iter().map(|d| d.id.clone()).collect(),
                confidence,
                reason,
                score,
                merged_preview: merged_preview(canonical, &members),
            }
        })
        .collect();

    suggestions.sort_by(|a, b| {
        a.confidence
            .cmp(&b.confidence)
            .then_with(|| b.duplicate_ids.len().cmp(&a.duplicate_ids.len()))
            .then_with(|| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal))
    });
    suggestions
}

/// Is this record assignment/exam-like enough to deadline-track? Keyword
/// match over the combined course+task text, or an LMS linkage. A synced
/// assignment is assignment-like by construction whatever its title says.
pub fn is_assignment_or_exam(course: &str, task: &str, canvas_assignment_id: Option<i64>) -> bool {
    if canvas_assignment_id.is_some() {
        return true;
    }
    let haystack = format!("{course} {task}").to_lowercase();
    ASSIGNMENT_KEYWORDS.iter().any(|kw| haystack.contains(kw))
}

pub fn deadline_is_assignment_or_exam(deadline: &Deadline) -> bool {
    is_assignment_or_exam(
        &deadline.course,
        &deadline.task,
        deadline.canvas_assignment_id,
    )
}

/// Outcome counters for one bridge run, used for logging/telemetry.
/// Business-logic conditions (duplicate, manual-owned, not-found) are
/// counters, never errors; only integration failures land in `errors`.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
    pub created_deadlines: Vec<Deadline>,
}

/// Bridge ownership predicates. A record belongs to the Canvas bridge when
/// it carries an LMS linkage; to the exam bridge by `exam-` id prefix, or
/// when it is automation-managed, unlinked, and exam-like; to the GitHub
/// bridge by id prefix, or as the remaining automation-managed case.
pub fn canvas_owned(deadline: &Deadline) -> bool {
    deadline.canvas_assignment_id.is_some()
}

pub fn exam_owned(deadline: &Deadline) -> bool {
    // The prefix claim matters when the exam keyword lived only in the
    // calendar event's description: the task alone looks mundane, but the
    // bridge still has to track the record it created.
    deadline.id.starts_with(EXAM_ID_PREFIX)
        || (deadline.is_automation_managed()
            && !canvas_owned(deadline)
            && task_looks_exam_like(&deadline.task))
}

pub fn github_owned(deadline: &Deadline) -> bool {
    deadline.id.starts_with(GITHUB_ID_PREFIX)
        || (deadline.is_automation_managed() && !canvas_owned(deadline) && !exam_owned(deadline))
}

fn bridge_deadline_id(prefix: &str, course_key: &str, task_key: &str) -> String {
    let seed = format!("{course_key}:{task_key}");
    format!(
        "{prefix}{}",
        Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes())
    )
}

/// The reconciliation algorithm shared by all three bridges.
///
/// Takes one store snapshot up front and appends creations to it, so later
/// candidates in the same run see earlier ones. Per candidate, matched by
/// normalized (course, task) key:
/// - unchanged due date (matches either the effective or the feed-reported
///   one) is a skip, which is what makes a repeated run idempotent;
/// - manual records (no `source_due_date`) are never touched;
/// - records owned by another bridge are left alone;
/// - owned records get the new date applied to both fields when the user
///   has not diverged, and to `source_due_date` only when they have;
/// - everything else is a create, with a deterministic prefixed id.
///
/// Candidates not strictly in the future are dropped before matching, so
/// stale scraped content never creates or resurrects old deadlines.
async fn reconcile_candidates<F>(
    store: &dyn DeadlineStore,
    user_id: &str,
    now: DateTime<Utc>,
    candidates: Vec<DeadlineCandidate>,
    owns: F,
    id_prefix: &str,
    rederive_priority_on_update: bool,
    report: &mut SyncReport,
) -> Result<(), StoreError>
where
    F: Fn(&Deadline) -> bool,
{
    let mut snapshot = store.list(user_id, now, true).await?;

    for candidate in candidates {
        if candidate.due_date <= now {
            continue;
        }

        let course_key = normalize_course_key(&candidate.course);
        let task_key = normalize_task_key(&candidate.task);
        let position = snapshot.iter().position(|d| {
            normalize_course_key(&d.course) == course_key
                && normalize_task_key(&d.task) == task_key
        });

        match position {
            Some(idx) => {
                let existing = &snapshot[idx];
                let unchanged = candidate.due_date == existing.due_date
                    || existing.source_due_date == Some(candidate.due_date);
                if unchanged || existing.source_due_date.is_none() || !owns(existing) {
                    report.skipped += 1;
                    continue;
                }

                let rederived = rederive_priority_on_update
                    .then(|| Priority::from_time_to_due(now, candidate.due_date));
                let patch = if existing.has_user_diverged() {
                    // The user edited the due date away from the feed; track
                    // the feed in `source_due_date` and leave their edit be.
                    DeadlinePatch {
                        source_due_date: Some(Some(candidate.due_date)),
                        priority: rederived,
                        ..Default::default()
                    }
                } else {
                    DeadlinePatch {
                        due_date: Some(candidate.due_date),
                        source_due_date: Some(Some(candidate.due_date)),
                        priority: rederived,
                        ..Default::default()
                    }
                };

                match store.update(user_id, &existing.id, patch).await? {
                    Some(updated) => {
                        report.updated += 1;
                        snapshot[idx] = updated;
                    }
                    // Vanished between snapshot and write: a skip, not a failure.
                    None => report.skipped += 1,
                }
            }
            None => {
                let created = store
                    .create(
                        user_id,
                        NewDeadline {
                            id: Some(bridge_deadline_id(id_prefix, &course_key, &task_key)),
                            course: candidate.course.clone(),
                            task: candidate.task.clone(),
                            due_date: candidate.due_date,
                            source_due_date: Some(candidate.due_date),
                            priority: Priority::from_time_to_due(now, candidate.due_date),
                            completed: false,
                            canvas_assignment_id: candidate.canvas_assignment_id,
                        },
                    )
                    .await?;
                snapshot.push(created.clone());
                report.created_deadlines.push(created);
                report.created += 1;
            }
        }
    }

    Ok(())
}

/// Reconcile a Canvas assignment payload. Linkage makes every candidate
/// eligible; priority is not re-derived on updates (the LMS-linked path
/// keeps whatever the user set).
pub async fn sync_canvas(
    store: &dyn DeadlineStore,
    user_id: &str,
    assignments: &[CanvasAssignment],
    now: DateTime<Utc>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let candidates: Vec<DeadlineCandidate> = canvas_candidates(assignments)
        .into_iter()
        .filter(|c| is_assignment_or_exam(&c.course, &c.task, c.canvas_assignment_id))
        .collect();

    if let Err(err) = reconcile_candidates(
        store,
        user_id,
        now,
        candidates,
        canvas_owned,
        "canvas-",
        false,
        &mut report,
    )
    .await
    {
        report.errors.push(format!("canvas sync: {err}"));
    }
    info!(
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "canvas sync finished"
    );
    report
}

/// One course entry in the registry the GitHub bridge walks.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CourseConfig {
    pub code: String,
    pub display_name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub canvas_course_id: Option<i64>,
    #[serde(default)]
    pub github_owner_hint: Option<String>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CourseRegistry {
    pub courses: Vec<CourseConfig>,
}

impl CourseRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Reconcile README-scraped deadlines for every enabled course. A failed
/// repository search or README fetch is a per-course error string; the
/// remaining courses still reconcile. Priority is re-derived on every
/// update, matching the feed-driven paths.
pub async fn sync_github(
    store: &dyn DeadlineStore,
    user_id: &str,
    client: &dyn GithubClient,
    courses: &[CourseConfig],
    now: DateTime<Utc>,
) -> SyncReport {
    let mut report = SyncReport::default();

    for course in courses.iter().filter(|c| c.enabled) {
        let code = normalize_course_key(&course.code);
        let query = match &course.github_owner_hint {
            Some(owner) => format!("user:{owner} {}", code.to_lowercase()),
            None => code.to_lowercase(),
        };

        let repos = match client.search_repositories(&query).await {
            Ok(repos) => repos,
            Err(err) => {
                warn!(course = %code, %err, "repository search failed");
                report
                    .errors
                    .push(format!("{code}: repository search failed: {err}"));
                continue;
            }
        };
        let Some(repo) = pick_repository(&repos, &code) else {
            report.errors.push(format!("{code}: no repository matched"));
            continue;
        };

        let readme = match client.fetch_readme(&repo.full_name).await {
            Ok(text) => text,
            Err(err) => {
                warn!(course = %code, repo = %repo.full_name, %err, "README fetch failed");
                report
                    .errors
                    .push(format!("{code}: fetching README of {}: {err}", repo.full_name));
                continue;
            }
        };

        let candidates: Vec<DeadlineCandidate> = parse_readme_deadlines(&course.code, &readme)
            .into_iter()
            .filter(|c| is_assignment_or_exam(&c.course, &c.task, None))
            .collect();

        if let Err(err) = reconcile_candidates(
            store,
            user_id,
            now,
            candidates,
            github_owned,
            GITHUB_ID_PREFIX,
            true,
            &mut report,
        )
        .await
        {
            report.errors.push(format!("{code}: reconciling: {err}"));
        }
    }

    info!(
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "github sync finished"
    );
    report
}

/// Reconcile exam deadlines derived from calendar events. Extraction
/// already keyword-gates, so no second eligibility pass; priority is
/// re-derived on every update.
pub async fn sync_exam_calendar(
    store: &dyn DeadlineStore,
    user_id: &str,
    events: &[CalendarEvent],
    now: DateTime<Utc>,
) -> SyncReport {
    let mut report = SyncReport::default();
    let candidates = extract_exam_candidates(events);

    if let Err(err) = reconcile_candidates(
        store,
        user_id,
        now,
        candidates,
        exam_owned,
        EXAM_ID_PREFIX,
        true,
        &mut report,
    )
    .await
    {
        report.errors.push(format!("exam sync: {err}"));
    }
    info!(
        created = report.created,
        updated = report.updated,
        skipped = report.skipped,
        errors = report.errors.len(),
        "exam calendar sync finished"
    );
    report
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub courses_path: PathBuf,
    pub scheduler_enabled: bool,
    pub canvas_cron: String,
    pub github_cron: String,
    pub exam_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub github_api_base: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            courses_path: std::env::var("AXIS_COURSES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("courses.yaml")),
            scheduler_enabled: std::env::var("AXIS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            canvas_cron: std::env::var("AXIS_CANVAS_CRON")
                .unwrap_or_else(|_| "0 */30 * * * *".to_string()),
            github_cron: std::env::var("AXIS_GITHUB_CRON")
                .unwrap_or_else(|_| "0 15 */6 * * *".to_string()),
            exam_cron: std::env::var("AXIS_EXAM_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            user_agent: std::env::var("AXIS_USER_AGENT")
                .unwrap_or_else(|_| "axis-companion/0.1".to_string()),
            http_timeout_secs: std::env::var("AXIS_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            github_api_base: std::env::var("AXIS_GITHUB_API_BASE")
                .unwrap_or_else(|_| "https://api.github.com".to_string()),
        }
    }
}

/// One cron job per bridge when scheduling is enabled. The jobs only log a
/// trigger; the embedding application decides which runner reacts to it.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    for (bridge, cron) in [
        ("canvas", &config.canvas_cron),
        ("github", &config.github_cron),
        ("exam", &config.exam_cron),
    ] {
        let label = bridge.to_string();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let label = label.clone();
            Box::pin(async move {
                warn!(bridge = %label, "scheduled bridge trigger fired; no runner attached");
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axis_sources::{RepoSummary, SourceError};
    use axis_store::MemoryDeadlineStore;
    use chrono::TimeZone;
    use std::io::Write;

    const USER: &str = "stine";

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    fn deadline(id: &str, course: &str, task: &str, due: DateTime<Utc>) -> Deadline {
        Deadline {
            id: id.to_string(),
            course: course.to_string(),
            task: task.to_string(),
            due_date: due,
            source_due_date: None,
            priority: Priority::Medium,
            completed: false,
            canvas_assignment_id: None,
        }
    }

    fn candidate(course: &str, task: &str, due: DateTime<Utc>) -> DeadlineCandidate {
        DeadlineCandidate {
            course: course.to_string(),
            task: task.to_string(),
            due_date: due,
            canvas_assignment_id: None,
        }
    }

    #[test]
    fn course_mismatch_is_an_absolute_gate() {
        let due = ts(2026, 3, 20, 23, 59);
        let a = deadline("a", "DAT560", "Assignment 1", due);
        let b = deadline("b", "ELE320", "Assignment 1", due);
        let signal = duplicate_signal(&a, &b);
        assert!(!signal.is_duplicate);
        assert_eq!(signal.score, 0.0);
        assert!(!signal.course_match);
    }

    #[test]
    fn date_gate_vetoes_identical_tasks() {
        let a = deadline("a", "DAT560", "Assignment 1", ts(2026, 3, 6, 23, 59));
        let b = deadline("b", "DAT560", "Assignment 1", ts(2026, 3, 20, 23, 59));
        let signal = duplicate_signal(&a, &b);
        assert_eq!(signal.task_score, 1.0);
        assert!(signal.due_distance_days > DUE_WINDOW_DAYS);
        assert!(!signal.is_duplicate);
    }

    #[test]
    fn section_suffixes_do_not_break_course_match() {
        let a = deadline("a", "DAT560-1", "Assignment 1", ts(2026, 3, 20, 22, 0));
        let b = deadline("b", "DAT560", "Assignment 1", ts(2026, 3, 20, 23, 59));
        assert!(duplicate_signal(&a, &b).is_duplicate);
    }

    #[test]
    fn substring_similarity_requires_a_meaningful_shorter_side() {
        assert_eq!(task_similarity("Obligatorisk 2", "Obligatorisk 2 graded"), 0.9);
        // "lab 2" is a substring of "lab 2 report writeup" but too short to
        // count as containment; stop-word removal leaves only "2" shared.
        assert!(task_similarity("Lab 2", "Lab 2 report writeup") < 0.9);
    }

    #[test]
    fn stop_words_are_ignored_in_token_overlap() {
        // "assignment"/"report" are noise words; overlap rests on "3".
        let score = task_similarity("Assignment 3 report", "report 3");
        assert_eq!(score, 1.0);
    }

    #[test]
    fn transitive_pairs_union_into_one_group() {
        // a~b and b~c by due-date proximity, a and c two full days apart.
        let a = deadline("a", "DAT560", "Oblig 1", ts(2026, 3, 19, 12, 0));
        let b = deadline("b", "DAT560", "Oblig 1", ts(2026, 3, 20, 12, 0));
        let c = deadline("c", "DAT560", "Oblig 1", ts(2026, 3, 21, 12, 0));
        let groups = duplicate_groups(&[a, b, c]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_ids.len(), 3);
    }

    #[test]
    fn singletons_are_not_groups() {
        let a = deadline("a", "DAT560", "Oblig 1", ts(2026, 3, 19, 12, 0));
        let b = deadline("b", "ELE320", "Oblig 1", ts(2026, 3, 19, 12, 0));
        assert!(duplicate_groups(&[a, b]).is_empty());
    }

    fn scenario_one() -> Vec<Deadline> {
        let mut manual = deadline(
            "m1",
            "DAT560",
            "Assignment 3 Report",
            ts(2026, 3, 20, 23, 59),
        );
        manual.priority = Priority::High;

        let mut canvas = deadline(
            "c1",
            "DAT560-1",
            "Assignment 3: report",
            ts(2026, 3, 20, 22, 0),
        );
        canvas.source_due_date = Some(canvas.due_date);
        canvas.canvas_assignment_id = Some(9001);

        let mut github = deadline(
            "github-1",
            "DAT560",
            "Assignment 3 report",
            ts(2026, 3, 21, 0, 30),
        );
        github.source_due_date = Some(github.due_date);
        github.priority = Priority::Low;

        vec![manual, canvas, github]
    }

    #[test]
    fn three_source_group_prefers_the_manual_record() {
        let deadlines = scenario_one();
        let suggestions = merge_suggestions(&deadlines);
        assert_eq!(suggestions.len(), 1);
        let s = &suggestions[0];
        assert_eq!(s.canonical_id, "m1");
        assert_eq!(s.canonical_source, DeadlineSource::Manual);
        assert_eq!(s.duplicate_ids.len(), 2);
        assert_eq!(s.confidence, Confidence::High);
        assert_eq!(s.merged_preview.priority, Priority::High);
        assert_eq!(s.merged_preview.due_date, ts(2026, 3, 20, 22, 0));
        assert!(!s.merged_preview.completed);
    }

    #[test]
    fn canvas_outranks_github_when_no_manual_exists() {
        let deadlines: Vec<Deadline> = scenario_one()
            .into_iter()
            .filter(|d| d.id != "m1")
            .collect();
        let suggestions = merge_suggestions(&deadlines);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].canonical_id, "c1");
        assert_eq!(suggestions[0].canonical_source, DeadlineSource::Canvas);
    }

    #[test]
    fn incomplete_record_outranks_a_completed_manual_one() {
        let mut deadlines = scenario_one();
        deadlines[0].completed = true;
        let suggestions = merge_suggestions(&deadlines);
        assert_eq!(suggestions[0].canonical_id, "c1");
        assert!(suggestions[0].merged_preview.completed);
    }

    #[test]
    fn eligibility_accepts_linkage_without_keywords() {
        assert!(is_assignment_or_exam("DAT560", "Untitled thing", Some(42)));
        assert!(is_assignment_or_exam("DAT560", "Oblig 2", None));
        assert!(is_assignment_or_exam("DAT560", "Final presentation", None));
        assert!(!is_assignment_or_exam("DAT560", "Guest lecture", None));
    }

    fn canvas_assignment(id: i64, name: &str, due: DateTime<Utc>) -> CanvasAssignment {
        CanvasAssignment {
            id,
            name: name.to_string(),
            due_at: Some(due),
            course_name: "DAT560-1".to_string(),
        }
    }

    #[tokio::test]
    async fn canvas_sync_creates_then_is_idempotent() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let assignments = vec![
            canvas_assignment(9001, "Assignment 3: report", ts(2026, 3, 20, 22, 0)),
            canvas_assignment(9002, "Assignment 4", ts(2026, 4, 2, 22, 0)),
        ];

        let first = sync_canvas(&store, USER, &assignments, now).await;
        assert_eq!(first.created, 2);
        assert_eq!(first.updated, 0);
        assert!(first.errors.is_empty());
        assert_eq!(first.created_deadlines.len(), 2);
        assert!(first.created_deadlines[0].id.starts_with("canvas-"));
        assert_eq!(
            first.created_deadlines[0].source_due_date,
            Some(first.created_deadlines[0].due_date)
        );

        let second = sync_canvas(&store, USER, &assignments, now).await;
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.skipped, 2);
    }

    #[tokio::test]
    async fn undiverged_records_track_the_feed_completely() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let original = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 20, 22, 0))];
        sync_canvas(&store, USER, &original, now).await;

        let moved = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 22, 22, 0))];
        let report = sync_canvas(&store, USER, &moved, now).await;
        assert_eq!(report.updated, 1);

        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records[0].due_date, ts(2026, 3, 22, 22, 0));
        assert_eq!(records[0].source_due_date, Some(ts(2026, 3, 22, 22, 0)));
    }

    #[tokio::test]
    async fn diverged_records_keep_the_users_due_date() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let original = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 20, 22, 0))];
        let created = sync_canvas(&store, USER, &original, now).await.created_deadlines;

        // The user pushes their own due date earlier.
        store
            .update(
                USER,
                &created[0].id,
                DeadlinePatch {
                    due_date: Some(ts(2026, 3, 18, 20, 0)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let moved = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 25, 22, 0))];
        let report = sync_canvas(&store, USER, &moved, now).await;
        assert_eq!(report.updated, 1);

        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records[0].due_date, ts(2026, 3, 18, 20, 0));
        assert_eq!(records[0].source_due_date, Some(ts(2026, 3, 25, 22, 0)));
    }

    #[tokio::test]
    async fn manual_records_are_immune_to_bridges() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        store
            .seed(
                USER,
                vec![deadline(
                    "m1",
                    "DAT560",
                    "Assignment 3",
                    ts(2026, 3, 18, 23, 59),
                )],
            )
            .await;

        let assignments = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 20, 22, 0))];
        let report = sync_canvas(&store, USER, &assignments, now).await;
        assert_eq!(report.created, 0);
        assert_eq!(report.updated, 0);
        assert_eq!(report.skipped, 1);

        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "m1");
        assert_eq!(records[0].due_date, ts(2026, 3, 18, 23, 59));
        assert!(records[0].source_due_date.is_none());
    }

    #[tokio::test]
    async fn past_candidates_never_reach_the_store() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 2, 20, 12, 0);
        let events = vec![CalendarEvent {
            summary: "DAT560 midterm exam".into(),
            start_time: ts(2026, 2, 18, 9, 0),
            description: None,
        }];
        let report = sync_exam_calendar(&store, USER, &events, now).await;
        assert_eq!(report.created, 0);
        assert!(store.list(USER, now, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exam_bridge_creates_prefixed_records_and_rederives_priority() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 5, 1, 12, 0);
        let events = vec![CalendarEvent {
            summary: "DAT560 Final exam".into(),
            start_time: ts(2026, 5, 12, 9, 0),
            description: None,
        }];

        let report = sync_exam_calendar(&store, USER, &events, now).await;
        assert_eq!(report.created, 1);
        let created = &report.created_deadlines[0];
        assert!(created.id.starts_with("exam-"));
        assert_eq!(created.priority, Priority::Medium);

        // The exam moves to tomorrow: due tracks the feed and priority is
        // re-derived from the new time-to-due.
        let moved = vec![CalendarEvent {
            summary: "DAT560 Final exam".into(),
            start_time: ts(2026, 5, 2, 9, 0),
            description: None,
        }];
        let report = sync_exam_calendar(&store, USER, &moved, now).await;
        assert_eq!(report.updated, 1);
        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records[0].priority, Priority::Critical);
    }

    #[tokio::test]
    async fn exam_bridge_reclaims_records_whose_keyword_was_only_in_the_description() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 5, 1, 12, 0);
        // "assessment" matches no exam keyword; only the description does.
        let events = vec![CalendarEvent {
            summary: "DAT560 assessment".into(),
            start_time: ts(2026, 5, 10, 9, 0),
            description: Some("Written exam, hall C".into()),
        }];

        let first = sync_exam_calendar(&store, USER, &events, now).await;
        assert_eq!(first.created, 1);
        assert!(first.created_deadlines[0].id.starts_with(EXAM_ID_PREFIX));
        assert!(!task_looks_exam_like(&first.created_deadlines[0].task));

        let moved = vec![CalendarEvent {
            summary: "DAT560 assessment".into(),
            start_time: ts(2026, 5, 12, 9, 0),
            description: Some("Written exam, hall C".into()),
        }];
        let second = sync_exam_calendar(&store, USER, &moved, now).await;
        assert_eq!(second.updated, 1);
        assert_eq!(second.skipped, 0);

        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records[0].due_date, ts(2026, 5, 12, 9, 0));
        assert_eq!(records[0].source_due_date, Some(ts(2026, 5, 12, 9, 0)));
    }

    #[tokio::test]
    async fn canvas_updates_do_not_rederive_priority() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let original = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 20, 22, 0))];
        let created = sync_canvas(&store, USER, &original, now).await.created_deadlines;

        store
            .update(
                USER,
                &created[0].id,
                DeadlinePatch {
                    priority: Some(Priority::Critical),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let moved = vec![canvas_assignment(9001, "Assignment 3", ts(2026, 3, 27, 22, 0))];
        sync_canvas(&store, USER, &moved, now).await;
        let records = store.list(USER, now, true).await.unwrap();
        assert_eq!(records[0].priority, Priority::Critical);
    }

    struct FakeGithub {
        repos: Vec<RepoSummary>,
        readme: String,
        fail_search_for: Option<String>,
    }

    #[async_trait]
    impl GithubClient for FakeGithub {
        async fn search_repositories(&self, query: &str) -> Result<Vec<RepoSummary>, SourceError> {
            if let Some(needle) = &self.fail_search_for {
                if query.contains(needle.as_str()) {
                    return Err(SourceError::Message("search exploded".into()));
                }
            }
            Ok(self.repos.clone())
        }

        async fn fetch_readme(&self, _full_name: &str) -> Result<String, SourceError> {
            Ok(self.readme.clone())
        }
    }

    fn course(code: &str) -> CourseConfig {
        CourseConfig {
            code: code.to_string(),
            display_name: code.to_string(),
            enabled: true,
            canvas_course_id: None,
            github_owner_hint: None,
        }
    }

    #[tokio::test]
    async fn github_sync_scrapes_filters_and_creates() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 2, 10, 12, 0);
        let client = FakeGithub {
            repos: vec![RepoSummary {
                name: "info".into(),
                full_name: "uis-dat560/info".into(),
                owner: "uis-dat560".into(),
            }],
            readme: "\
| 7 | 11.02.2026 | Graph algorithms |
| 8 | 18.02.2026 | **Assignment 2 deadline** |
"
            .into(),
            fail_search_for: None,
        };

        let report = sync_github(&store, USER, &client, &[course("DAT560")], now).await;
        // The lecture-topic row is not assignment-like and never reconciles.
        assert_eq!(report.created, 1);
        assert!(report.errors.is_empty());
        let created = &report.created_deadlines[0];
        assert!(created.id.starts_with("github-"));
        assert_eq!(created.task, "Assignment 2 deadline");
        assert_eq!(created.due_date, ts(2026, 2, 18, 23, 59));
    }

    #[tokio::test]
    async fn past_readme_rows_drop_while_extension_lines_survive() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 2, 10, 12, 0);
        let client = FakeGithub {
            repos: vec![RepoSummary {
                name: "info".into(),
                full_name: "uis-dat560/info".into(),
                owner: "uis-dat560".into(),
            }],
            readme: "\
| 1 | 01.02.2026 | Assignment 1 deadline |

Assignment 1 deadline extended to 22.02.2026.
"
            .into(),
            fail_search_for: None,
        };

        let report = sync_github(&store, USER, &client, &[course("DAT560")], now).await;
        assert_eq!(report.created, 1);
        assert_eq!(report.created_deadlines[0].due_date, ts(2026, 2, 22, 23, 59));
    }

    #[tokio::test]
    async fn extension_lines_replace_table_rows_when_both_dates_are_future() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 2, 20, 12, 0);
        let client = FakeGithub {
            repos: vec![RepoSummary {
                name: "info".into(),
                full_name: "uis-dat560/info".into(),
                owner: "uis-dat560".into(),
            }],
            readme: "\
| 8 | 25.02.2026 | Assignment 2 deadline |

Assignment 2 deadline extended to 28.02.2026.
"
            .into(),
            fail_search_for: None,
        };

        let report = sync_github(&store, USER, &client, &[course("DAT560")], now).await;
        // One assignment, not two: the extension line supersedes the row.
        assert_eq!(report.created, 1);
        assert_eq!(report.created_deadlines[0].task, "Assignment 2 deadline");
        assert_eq!(report.created_deadlines[0].due_date, ts(2026, 2, 28, 23, 59));
    }

    #[tokio::test]
    async fn one_failing_course_does_not_block_the_others() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 2, 10, 12, 0);
        let client = FakeGithub {
            repos: vec![RepoSummary {
                name: "info".into(),
                full_name: "uis-ele320/info".into(),
                owner: "uis-ele320".into(),
            }],
            readme: "| 1 | 20.02.2026 | Lab 1 submission |".into(),
            fail_search_for: Some("dat560".into()),
        };

        let report = sync_github(
            &store,
            USER,
            &client,
            &[course("DAT560"), course("ELE320")],
            now,
        )
        .await;
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("DAT560"));
        assert_eq!(report.created, 1);
        assert_eq!(report.created_deadlines[0].course, "ELE320");
    }

    #[tokio::test]
    async fn later_candidates_see_creations_from_the_same_run() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let mut report = SyncReport::default();
        let candidates = vec![
            candidate("DAT560", "Oblig 1", ts(2026, 3, 10, 23, 59)),
            candidate("DAT560-1", "Oblig 1!", ts(2026, 3, 10, 23, 59)),
        ];
        reconcile_candidates(
            &store,
            USER,
            now,
            candidates,
            github_owned,
            GITHUB_ID_PREFIX,
            true,
            &mut report,
        )
        .await
        .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn foreign_automation_records_are_left_alone() {
        let store = MemoryDeadlineStore::new();
        let now = ts(2026, 3, 1, 12, 0);
        let mut canvas_record = deadline("c1", "DAT560", "Oblig 1", ts(2026, 3, 10, 23, 59));
        canvas_record.source_due_date = Some(canvas_record.due_date);
        canvas_record.canvas_assignment_id = Some(9001);
        store.seed(USER, vec![canvas_record]).await;

        let mut report = SyncReport::default();
        reconcile_candidates(
            &store,
            USER,
            now,
            vec![candidate("DAT560", "Oblig 1", ts(2026, 3, 12, 23, 59))],
            github_owned,
            GITHUB_ID_PREFIX,
            true,
            &mut report,
        )
        .await
        .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.updated, 0);
        assert_eq!(report.created, 0);
    }

    #[test]
    fn suggestions_sort_high_confidence_first() {
        let mut list = scenario_one();
        // A second, weaker pair in another course: same oblig, dates almost
        // two days apart drag the composite under the high bar.
        let d = deadline("x1", "ELE320", "Oblig 4 writeup", ts(2026, 4, 1, 12, 0));
        let mut e = deadline("x2", "ELE320", "Oblig 4 writeup final", ts(2026, 4, 3, 6, 0));
        e.source_due_date = Some(e.due_date);
        list.push(d);
        list.push(e);

        let suggestions = merge_suggestions(&list);
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].confidence, Confidence::High);
        assert_eq!(suggestions[1].confidence, Confidence::Medium);
    }

    #[test]
    fn course_registry_parses_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "courses:\n  - code: DAT560\n    display_name: Advanced Algorithms\n    canvas_course_id: 311\n  - code: ELE320\n    display_name: Control Systems\n    enabled: false\n    github_owner_hint: uis-ele320\n"
        )
        .unwrap();
        let registry = CourseRegistry::load(file.path()).unwrap();
        assert_eq!(registry.courses.len(), 2);
        assert!(registry.courses[0].enabled);
        assert_eq!(registry.courses[0].canvas_course_id, Some(311));
        assert!(!registry.courses[1].enabled);
        assert_eq!(
            registry.courses[1].github_owner_hint.as_deref(),
            Some("uis-ele320")
        );
    }

    #[tokio::test]
    async fn scheduler_is_off_unless_enabled() {
        let config = SyncConfig {
            courses_path: PathBuf::from("courses.yaml"),
            scheduler_enabled: false,
            canvas_cron: "0 */30 * * * *".into(),
            github_cron: "0 15 */6 * * *".into(),
            exam_cron: "0 0 6 * * *".into(),
            user_agent: "test".into(),
            http_timeout_secs: 5,
            github_api_base: "https://api.github.com".into(),
        };
        assert!(maybe_build_scheduler(&config).await.unwrap().is_none());
    }
}

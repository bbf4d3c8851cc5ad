//! Candidate extraction per deadline source: Canvas payloads, GitHub course
//! READMEs, and calendar exam events. Also owns the shared course/task text
//! normalization the reconciliation engine keys on.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use axis_core::{DeadlineCandidate, EXAM_KEYWORDS};
use axis_store::{ApiFetcher, FetchError};
use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "axis-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("no repository found for course {0}")]
    RepoNotFound(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

fn course_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b([a-z]{3})\s*-?\s*(\d{3})\b").unwrap())
}

fn dotted_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{1,2})\.(\d{1,2})\.(\d{4})\b").unwrap())
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").unwrap())
}

/// Canonical course key: the 3-letter+3-digit course code if the label
/// carries one (section suffixes like "DAT560-1" collapse to "DAT560"),
/// otherwise the alphanumeric-stripped uppercase label.
pub fn normalize_course_key(course: &str) -> String {
    if let Some(caps) = course_code_re().captures(course) {
        return format!(
            "{}{}",
            caps[1].to_uppercase(),
            &caps[2]
        );
    }
    course
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase()
}

/// Normalized task key: lowercase, punctuation collapsed to single spaces.
pub fn normalize_task_key(task: &str) -> String {
    task.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// First course code found in `text`, canonical form, if any.
pub fn extract_course_code(text: &str) -> Option<String> {
    course_code_re()
        .captures(text)
        .map(|caps| format!("{}{}", caps[1].to_uppercase(), &caps[2]))
}

/// Parse the first recognizable date in `text`. Dotted European dates
/// (`18.02.2026`) resolve to 23:59 UTC that day, the end-of-day convention
/// course READMEs assume; ISO dates (`2026-02-18`) resolve the same way.
pub fn parse_inline_date(text: &str) -> Option<DateTime<Utc>> {
    if let Some(caps) = dotted_date_re().captures(text) {
        let day: u32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let year: i32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(23, 59, 0))
            .map(|dt| dt.and_utc());
    }
    if let Some(caps) = iso_date_re().captures(text) {
        let year: i32 = caps[1].parse().ok()?;
        let month: u32 = caps[2].parse().ok()?;
        let day: u32 = caps[3].parse().ok()?;
        return NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(23, 59, 0))
            .map(|dt| dt.and_utc());
    }
    None
}

const DEADLINE_LINE_KEYWORDS: &[&str] = &["deadline", "due", "frist", "innlevering", "submission"];

/// Words left dangling at the end of a prose line once its date is removed
/// ("extended to", "due by", "frist til", "moved to"). Stripped so an
/// extension line keys identically to the schedule-table row it amends and
/// replaces it in the last-wins dedup.
const TRAILING_NOISE_WORDS: &[&str] = &[
    "to", "til", "by", "on", "at", "extended", "postponed", "moved", "utsatt",
];

fn strip_trailing_noise(mut task: String) -> String {
    loop {
        let trimmed_len = task
            .trim_end()
            .trim_end_matches(|c: char| c.is_ascii_punctuation())
            .trim_end()
            .len();
        task.truncate(trimmed_len);

        let lower = task.to_lowercase();
        let Some(cut) = TRAILING_NOISE_WORDS.iter().find_map(|word| {
            lower
                .strip_suffix(word)
                .filter(|rest| rest.ends_with(' '))
                .map(str::len)
        }) else {
            return task;
        };
        task.truncate(cut);
    }
}

fn strip_markdown_emphasis(text: &str) -> String {
    text.replace("**", "")
        .replace('*', "")
        .replace('`', "")
        .trim()
        .to_string()
}

/// Keep candidates unique by normalized task key. A later mention of the
/// same task replaces the earlier one, so a README row that extends a
/// deadline wins over the original entry.
fn dedup_last_wins(candidates: Vec<DeadlineCandidate>) -> Vec<DeadlineCandidate> {
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<DeadlineCandidate> = Vec::new();
    for candidate in candidates {
        let key = normalize_task_key(&candidate.task);
        match by_key.get(&key) {
            Some(&idx) => out[idx] = candidate,
            None => {
                by_key.insert(key, out.len());
                out.push(candidate);
            }
        }
    }
    out
}

fn candidate_from_table_row(course: &str, line: &str) -> Option<DeadlineCandidate> {
    let cells: Vec<String> = line
        .trim()
        .trim_matches('|')
        .split('|')
        .map(strip_markdown_emphasis)
        .collect();
    if cells.len() < 2 {
        return None;
    }

    let due_date = cells.iter().find_map(|c| parse_inline_date(c))?;
    // Task cell: the longest cell with letters that is not the date cell.
    let task = cells
        .iter()
        .filter(|c| parse_inline_date(c).is_none())
        .filter(|c| c.chars().any(|ch| ch.is_alphabetic()))
        .max_by_key(|c| c.len())?
        .clone();
    if task.is_empty() {
        return None;
    }

    Some(DeadlineCandidate {
        course: course.to_string(),
        task,
        due_date,
        canvas_assignment_id: None,
    })
}

fn candidate_from_inline_line(course: &str, line: &str) -> Option<DeadlineCandidate> {
    let cleaned = strip_markdown_emphasis(line);
    let lower = cleaned.to_lowercase();
    if !DEADLINE_LINE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return None;
    }
    let due_date = parse_inline_date(&cleaned)?;

    let mut task = dotted_date_re().replace_all(&cleaned, "").to_string();
    task = iso_date_re().replace_all(&task, "").to_string();
    let task = strip_trailing_noise(task.trim().to_string());
    if task.is_empty() {
        return None;
    }

    Some(DeadlineCandidate {
        course: course.to_string(),
        task,
        due_date,
        canvas_assignment_id: None,
    })
}

/// Scrape deadline candidates for one course out of a README.
///
/// Two shapes are recognized: schedule-table rows with a date cell and a
/// description cell (`| 8 | 18.02.2026 | **Assignment 2 deadline** |`), and
/// prose lines pairing a deadline keyword with a date. Rows whose dates do
/// not parse are dropped silently. The result is deduplicated by normalized
/// task key, last occurrence winning.
pub fn parse_readme_deadlines(course: &str, markdown: &str) -> Vec<DeadlineCandidate> {
    let mut candidates = Vec::new();
    for line in markdown.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('|') {
            if let Some(candidate) = candidate_from_table_row(course, trimmed) {
                candidates.push(candidate);
            }
        } else if let Some(candidate) = candidate_from_inline_line(course, trimmed) {
            candidates.push(candidate);
        }
    }
    dedup_last_wins(candidates)
}

/// Raw calendar event as handed over by the calendar integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub summary: String,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Exam-keyword extraction over calendar events. An event becomes a
/// candidate when its summary or description mentions an exam keyword and a
/// course code can be located in either; events without a course key are
/// skipped since nothing could ever match them.
pub fn extract_exam_candidates(events: &[CalendarEvent]) -> Vec<DeadlineCandidate> {
    let mut candidates = Vec::new();
    for event in events {
        let description = event.description.as_deref().unwrap_or_default();
        let haystack = format!("{} {}", event.summary, description).to_lowercase();
        if !EXAM_KEYWORDS.iter().any(|kw| haystack.contains(kw)) {
            continue;
        }
        let Some(course) =
            extract_course_code(&event.summary).or_else(|| extract_course_code(description))
        else {
            continue;
        };
        let task = event.summary.trim().to_string();
        if task.is_empty() {
            continue;
        }
        candidates.push(DeadlineCandidate {
            course,
            task,
            due_date: event.start_time,
            canvas_assignment_id: None,
        });
    }
    dedup_last_wins(candidates)
}

/// Assignment row from a Canvas course sync payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanvasAssignment {
    pub id: i64,
    pub name: String,
    pub due_at: Option<DateTime<Utc>>,
    pub course_name: String,
}

/// Map a Canvas payload to candidates. Assignments without a due date are
/// not deadline-trackable and are dropped.
pub fn canvas_candidates(assignments: &[CanvasAssignment]) -> Vec<DeadlineCandidate> {
    assignments
        .iter()
        .filter_map(|a| {
            let due_date = a.due_at?;
            Some(DeadlineCandidate {
                course: a.course_name.clone(),
                task: a.name.clone(),
                due_date,
                canvas_assignment_id: Some(a.id),
            })
        })
        .collect()
}

/// Repository hit from a code-host search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoSummary {
    pub name: String,
    pub full_name: String,
    pub owner: String,
}

/// Heuristic fit of a repository for a course's info/schedule repo. Tiers:
/// a repo literally named `info` ranks above one whose owner or full name
/// contains the course code, which ranks above a name merely containing
/// `info`. Jaro-Winkler against the course code breaks ties within a tier.
pub fn score_repository(repo: &RepoSummary, course_code: &str) -> f64 {
    let code = normalize_course_key(course_code).to_lowercase();
    let name = repo.name.to_lowercase();
    let full_name = repo.full_name.to_lowercase();
    let owner = repo.owner.to_lowercase();

    let tier = if name == "info" {
        3.0
    } else if owner.contains(&code) || full_name.contains(&code) {
        2.0
    } else if name.contains("info") {
        1.0
    } else {
        0.0
    };
    tier + jaro_winkler(&name, &code) * 0.5
}

/// Best-effort repository pick: highest score, full name as deterministic
/// tie-break. `None` when the search came back empty.
pub fn pick_repository<'a>(
    repos: &'a [RepoSummary],
    course_code: &str,
) -> Option<&'a RepoSummary> {
    repos.iter().max_by(|a, b| {
        score_repository(a, course_code)
            .partial_cmp(&score_repository(b, course_code))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.full_name.cmp(&a.full_name))
    })
}

/// Code-host access needed by the GitHub bridge. Tests swap in an in-memory
/// fake; production uses [`HttpGithubClient`].
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn search_repositories(&self, query: &str) -> Result<Vec<RepoSummary>, SourceError>;
    async fn fetch_readme(&self, full_name: &str) -> Result<String, SourceError>;
}

#[derive(Debug, Deserialize)]
struct RepoSearchResponse {
    items: Vec<RepoSearchItem>,
}

#[derive(Debug, Deserialize)]
struct RepoSearchItem {
    name: String,
    full_name: String,
    owner: RepoOwner,
}

#[derive(Debug, Deserialize)]
struct RepoOwner {
    login: String,
}

/// GitHub REST implementation over the bounded fetcher.
pub struct HttpGithubClient {
    fetcher: ApiFetcher,
    api_base: String,
}

impl HttpGithubClient {
    pub fn new(fetcher: ApiFetcher, api_base: impl Into<String>) -> Self {
        Self {
            fetcher,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl GithubClient for HttpGithubClient {
    async fn search_repositories(&self, query: &str) -> Result<Vec<RepoSummary>, SourceError> {
        let url = format!(
            "{}/search/repositories?q={}&per_page=10",
            self.api_base,
            query.replace(' ', "+")
        );
        let response: RepoSearchResponse = self.fetcher.fetch_json(Uuid::new_v4(), &url).await?;
        Ok(response
            .items
            .into_iter()
            .map(|item| RepoSummary {
                name: item.name,
                full_name: item.full_name,
                owner: item.owner.login,
            })
            .collect())
    }

    async fn fetch_readme(&self, full_name: &str) -> Result<String, SourceError> {
        let url = format!("{}/repos/{}/readme", self.api_base, full_name);
        let response = self
            .fetcher
            .fetch_bytes(Uuid::new_v4(), &url, Some("application/vnd.github.raw"))
            .await?;
        String::from_utf8(response.body)
            .map_err(|e| SourceError::Message(format!("readme for {full_name} is not utf-8: {e}")))
    }
}

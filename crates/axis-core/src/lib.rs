//! Core domain model for the AXIS deadline tracker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "axis-core";

/// Id prefix carried by deadlines the GitHub bridge created. Used only as an
/// inference fallback, never as an authoritative source signal.
pub const GITHUB_ID_PREFIX: &str = "github-";

/// Id prefix carried by deadlines the calendar-exam bridge created. Same
/// fallback role as [`GITHUB_ID_PREFIX`]; it also lets the exam bridge
/// reclaim its own records when the exam keyword lived only in the event
/// description and never made it into the task text.
pub const EXAM_ID_PREFIX: &str = "exam-";

/// Task keywords that mark a record as exam-like for source inference and
/// exam-bridge ownership.
pub const EXAM_KEYWORDS: &[&str] = &["exam", "eksamen", "final", "midterm", "vurdering"];

/// Urgency tier for a deadline. Bridges derive it from time-to-due at
/// creation time; users may override it afterwards.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Default priority for a freshly ingested deadline: due within 24h is
    /// critical, within 96h is high, anything further out is medium.
    pub fn from_time_to_due(now: DateTime<Utc>, due: DateTime<Utc>) -> Self {
        let remaining = due - now;
        if remaining <= Duration::hours(24) {
            Priority::Critical
        } else if remaining <= Duration::hours(96) {
            Priority::High
        } else {
            Priority::Medium
        }
    }
}

/// Where a deadline record originated. Ordering doubles as the authority
/// rank used for canonical selection: manual entries outrank every feed,
/// Canvas outranks GitHub, and calendar-derived exam records rank last.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeadlineSource {
    Manual,
    Canvas,
    Github,
    Exam,
}

/// Canonical deadline entity as held by the entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deadline {
    pub id: String,
    pub course: String,
    pub task: String,
    /// Effective due date the user sees. User-editable.
    pub due_date: DateTime<Utc>,
    /// Due date most recently reported by the owning feed. Absent on
    /// purely manual records.
    pub source_due_date: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub completed: bool,
    pub canvas_assignment_id: Option<i64>,
}

impl Deadline {
    /// A record with a feed-reported due date is automation-managed: some
    /// bridge is actively syncing it.
    pub fn is_automation_managed(&self) -> bool {
        self.source_due_date.is_some()
    }

    /// The user diverged when their edited due date no longer equals the
    /// feed-reported one. Only meaningful for automation-managed records.
    pub fn has_user_diverged(&self) -> bool {
        match self.source_due_date {
            Some(source) => self.due_date != source,
            None => false,
        }
    }

    /// Infer provenance from the record itself. Signals in priority order:
    /// a missing `source_due_date` means manual entry, an LMS linkage means
    /// Canvas, a `github-` id prefix means the GitHub bridge, an exam-like
    /// task means the calendar bridge, and anything else defaults to GitHub
    /// (the remaining automation-managed case).
    pub fn inferred_source(&self) -> DeadlineSource {
        if self.source_due_date.is_none() {
            return DeadlineSource::Manual;
        }
        if self.canvas_assignment_id.is_some() {
            return DeadlineSource::Canvas;
        }
        if self.id.starts_with(GITHUB_ID_PREFIX) {
            return DeadlineSource::Github;
        }
        if self.id.starts_with(EXAM_ID_PREFIX) || task_looks_exam_like(&self.task) {
            return DeadlineSource::Exam;
        }
        DeadlineSource::Github
    }
}

/// True if the task text contains any exam keyword.
pub fn task_looks_exam_like(task: &str) -> bool {
    let lower = task.to_lowercase();
    EXAM_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Ephemeral `(course, task, dueDate)` candidate extracted from a source
/// before reconciliation. At extraction time the feed-reported due date is
/// the due date, so no separate field is carried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlineCandidate {
    pub course: String,
    pub task: String,
    pub due_date: DateTime<Utc>,
    pub canvas_assignment_id: Option<i64>,
}

/// Create payload for the entity store. Bridges pass a prefixed id; manual
/// creation leaves `id` empty and lets the store mint one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDeadline {
    pub id: Option<String>,
    pub course: String,
    pub task: String,
    pub due_date: DateTime<Utc>,
    pub source_due_date: Option<DateTime<Utc>>,
    pub priority: Priority,
    pub completed: bool,
    pub canvas_assignment_id: Option<i64>,
}

/// Partial update payload. `None` fields are left untouched; `source_due_date`
/// uses a nested option so a bridge can clear it explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeadlinePatch {
    pub course: Option<String>,
    pub task: Option<String>,
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_due_date: Option<Option<DateTime<Utc>>>,
    pub priority: Option<Priority>,
    pub completed: Option<bool>,
}

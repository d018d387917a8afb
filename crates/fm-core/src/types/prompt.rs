use crate::types::enums::{AttemptOutcome, ErrorKind, PromptStatus};
use crate::types::ids::{ProjectId, PromptId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One queued unit of work. Owned exclusively by the prompt store; everything
/// else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub id: PromptId,
    pub text: String,
    #[serde(default)]
    pub project_id: Option<ProjectId>,
    pub status: PromptStatus,
    #[serde(default)]
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// FIFO sort key; reset to "now" on every requeue.
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Meaningful only while status is `server_restarting`.
    #[serde(default)]
    pub requires_follow_up: bool,
    /// Transient cooperative-cancellation flag; cleared on load.
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub result_summary: Option<String>,
    /// Append-only, one entry per execution trial including retries.
    #[serde(default)]
    pub attempts: Vec<Attempt>,
}

impl Prompt {
    pub fn new(id: PromptId, text: String, project_id: Option<ProjectId>) -> Self {
        let now = Utc::now();
        Self {
            id,
            text,
            project_id,
            status: PromptStatus::Queued,
            branch_name: None,
            created_at: now,
            updated_at: now,
            enqueued_at: now,
            started_at: None,
            finished_at: None,
            requires_follow_up: false,
            cancel_requested: false,
            result_summary: None,
            attempts: Vec::new(),
        }
    }
}

/// One execution trial of a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-based index within the prompt's attempt list.
    pub sequence: u32,
    pub started_at: DateTime<Utc>,
    /// Queue wait preceding this attempt, stamped by the store at dequeue.
    #[serde(default)]
    pub wait_secs: Option<f64>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub outcome: Option<AttemptOutcome>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Attempt {
    pub fn open(sequence: u32) -> Self {
        Self {
            sequence,
            started_at: Utc::now(),
            wait_secs: None,
            finished_at: None,
            duration_secs: None,
            exit_code: None,
            outcome: None,
            error_kind: None,
            summary: None,
        }
    }

    pub fn close(
        &mut self,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        exit_code: Option<i32>,
        summary: impl Into<String>,
    ) {
        let now = Utc::now();
        self.finished_at = Some(now);
        self.duration_secs = Some(duration_secs(self.started_at, now));
        self.exit_code = exit_code;
        self.outcome = Some(outcome);
        self.error_kind = error_kind;
        self.summary = Some(summary.into());
    }

    pub fn is_open(&self) -> bool {
        self.finished_at.is_none()
    }
}

pub(crate) fn duration_secs(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds();
    if millis < 0 {
        0.0
    } else {
        millis as f64 / 1000.0
    }
}

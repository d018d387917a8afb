use crate::error::StoreError;
use crate::scope::ScopeViolationRecord;
use crate::types::enums::{AttemptOutcome, PromptStatus, StreamKind};
use crate::types::ids::{ProjectId, PromptId};
use crate::types::io::{HealthSnapshot, QueueSnapshot};
use crate::types::prompt::{Attempt, Prompt};
use chrono::{DateTime, Utc};

/// Extra fields applied together with a status transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub result_summary: Option<String>,
    pub requires_follow_up: Option<bool>,
}

/// The prompt store owns every prompt record; all mutation goes through it.
///
/// Implementations guard mutations with a single mutex and keep critical
/// sections free of blocking process I/O. Timestamp bookkeeping belongs to
/// `transition`: moving to `queued` resets `enqueued_at` (retries join the
/// back of the FIFO), moving to `running` stamps `started_at`, and leaving
/// `running` stamps `finished_at` and clears the cancellation flag.
pub trait PromptStore: Send + Sync + 'static {
    fn enqueue(&self, text: &str, project_id: Option<ProjectId>) -> Result<Prompt, StoreError>;
    fn get(&self, id: &PromptId) -> Result<Option<Prompt>, StoreError>;
    /// Ordered view: queued by `enqueued_at` ascending, then running, then
    /// the rest by most recent update.
    fn list(&self) -> Result<Vec<Prompt>, StoreError>;
    /// Fails with `InvalidState` unless the prompt is queued.
    fn edit_text(&self, id: &PromptId, text: &str) -> Result<Prompt, StoreError>;
    /// Fails with `InvalidState` unless the prompt is queued.
    fn delete(&self, id: &PromptId) -> Result<Prompt, StoreError>;
    /// Validates the edge against the state machine.
    fn transition(
        &self,
        id: &PromptId,
        to: PromptStatus,
        fields: TransitionFields,
    ) -> Result<Prompt, StoreError>;
    fn append_attempt(&self, id: &PromptId, attempt: Attempt) -> Result<Prompt, StoreError>;
    /// Replace the attempt with the same sequence number.
    fn update_attempt(&self, id: &PromptId, attempt: Attempt) -> Result<Prompt, StoreError>;
    fn set_cancel_requested(&self, id: &PromptId, value: bool) -> Result<Prompt, StoreError>;
    fn set_branch(&self, id: &PromptId, branch: Option<String>) -> Result<Prompt, StoreError>;
    /// The queued prompt with the lowest `enqueued_at`, if any.
    fn next_queued(&self) -> Result<Option<Prompt>, StoreError>;
    fn snapshot(&self) -> Result<QueueSnapshot, StoreError>;
    fn health(&self) -> Result<HealthSnapshot, StoreError>;
}

/// Closing section of an attempt's transcript block.
#[derive(Debug, Clone)]
pub struct AttemptFooter {
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub duration_secs: f64,
    pub summary: String,
    pub workflow_notes: Vec<String>,
    pub finished_at: DateTime<Utc>,
}

/// Durable, append-only per-prompt transcript, sectioned by attempt and
/// stream. Chunks are flushed as they arrive so output survives a crash.
pub trait TranscriptStore: Send + Sync {
    fn begin_attempt(
        &self,
        id: &PromptId,
        attempt: u32,
        prompt_text: &str,
        context: &str,
    ) -> Result<(), StoreError>;
    fn append_chunk(
        &self,
        id: &PromptId,
        attempt: u32,
        stream: StreamKind,
        text: &str,
    ) -> Result<(), StoreError>;
    fn close_attempt(
        &self,
        id: &PromptId,
        attempt: u32,
        footer: &AttemptFooter,
    ) -> Result<(), StoreError>;
    /// Free-standing note outside any attempt block (recovery messages).
    fn append_note(&self, id: &PromptId, note: &str) -> Result<(), StoreError>;
    fn read(&self, id: &PromptId) -> Result<String, StoreError>;
    fn remove(&self, id: &PromptId) -> Result<(), StoreError>;
}

/// Append-only scope-violation log, one JSON object per line.
pub trait ViolationLog: Send + Sync {
    fn append(&self, record: &ScopeViolationRecord) -> Result<(), StoreError>;
}

use crate::types::enums::PromptStatus;
use crate::types::ids::PromptId;
use crate::types::prompt::Prompt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Full ordered view of the queue, replayed to every subscriber on connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    #[serde(flatten)]
    pub prompt: Prompt,
    /// 0-based position among queued prompts; absent for other statuses.
    #[serde(default)]
    pub queue_position: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
    pub server_restarting: usize,
}

impl StatusCounts {
    pub fn bump(&mut self, status: PromptStatus) {
        match status {
            PromptStatus::Queued => self.queued += 1,
            PromptStatus::Running => self.running += 1,
            PromptStatus::Completed => self.completed += 1,
            PromptStatus::Failed => self.failed += 1,
            PromptStatus::Canceled => self.canceled += 1,
            PromptStatus::ServerRestarting => self.server_restarting += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub counts: StatusCounts,
    #[serde(default)]
    pub oldest_queued: Option<OldestInfo>,
    #[serde(default)]
    pub oldest_running: Option<OldestInfo>,
    pub durations: DurationStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldestInfo {
    pub prompt_id: PromptId,
    pub timestamp: DateTime<Utc>,
    pub age_secs: f64,
}

/// Rolling aggregates over the most recent finished attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub window: usize,
    pub samples: usize,
    pub wait: DurationAggregate,
    pub run: DurationAggregate,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationAggregate {
    #[serde(default)]
    pub average: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    pub count: usize,
}

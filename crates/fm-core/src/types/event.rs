use crate::types::enums::StreamKind;
use crate::types::ids::PromptId;
use crate::types::io::{HealthSnapshot, QueueSnapshot};
use crate::types::prompt::Prompt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic payloads carried by the event bus. Serialized with a `type` tag so a
/// WebSocket client can route on the topic name alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    QueueSnapshot { snapshot: QueueSnapshot },
    PromptUpdate { prompt: Prompt },
    PromptDeleted { prompt_id: PromptId },
    PromptStream { chunk: StreamChunk },
    Health { health: HealthSnapshot },
}

/// One streamed output chunk. `seq` increases monotonically per stream within
/// an attempt; `reset` marks the start of a fresh attempt and `done` its end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub prompt_id: PromptId,
    pub attempt: u32,
    pub stream: StreamKind,
    pub seq: u64,
    pub chunk: String,
    #[serde(default)]
    pub reset: bool,
    #[serde(default)]
    pub done: bool,
    pub at: DateTime<Utc>,
}

pub mod enums;
pub mod event;
pub mod ids;
pub mod io;
pub mod prompt;
pub mod scope;

pub use enums::{AttemptOutcome, ErrorKind, PromptStatus, StreamKind};
pub use event::{EventBody, StreamChunk};
pub use ids::{IdError, ProjectId, PromptId};
pub use io::{
    DurationAggregate, DurationStats, HealthSnapshot, OldestInfo, QueueItem, QueueSnapshot,
    StatusCounts,
};
pub use prompt::{Attempt, Prompt};
pub use scope::ScopeManifest;

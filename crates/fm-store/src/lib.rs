pub mod document;
pub mod transcript;
pub mod violations;

pub use document::JsonStore;
pub use transcript::{parse_transcript, AttemptLog, TranscriptWriter};
pub use violations::ViolationLogFile;

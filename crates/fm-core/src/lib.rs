pub mod config;
pub mod engine;
pub mod error;
pub mod projects;
pub mod recovery;
pub mod runner;
pub mod scope;
pub mod store;
pub mod types;
pub mod validation;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, RunnerError, ScopeError, StoreError, WorkspaceError};
pub use store::{PromptStore, TranscriptStore, ViolationLog};

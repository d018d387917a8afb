use crate::types::enums::PromptStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("prompt not found")]
    NotFound,
    #[error("invalid state: {message}")]
    InvalidState { message: String },
    #[error("invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: PromptStatus,
        to: PromptStatus,
    },
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("store io error: {message}")]
    Io { message: String },
    #[error("store document corrupt: {message}")]
    Corrupt { message: String },
}

impl From<std::io::Error> for StoreError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("working tree has uncommitted changes")]
    Dirty,
    #[error("repository root is not a git work tree")]
    NotAWorkTree,
    #[error("base branch '{name}' does not exist")]
    BaseBranchMissing { name: String },
    #[error("fast-forward failed: {reason}")]
    FastForwardFailed { reason: String },
    #[error("git backend error: {reason}")]
    Backend { reason: String },
}

impl From<fm_vcs::backend::VcsError> for WorkspaceError {
    fn from(value: fm_vcs::backend::VcsError) -> Self {
        use fm_vcs::backend::VcsError;
        match value {
            VcsError::NotAWorkTree => Self::NotAWorkTree,
            VcsError::DirtyWorkTree => Self::Dirty,
            VcsError::BaseBranchMissing { name } => Self::BaseBranchMissing { name },
            VcsError::FastForwardFailed { reason, .. } => Self::FastForwardFailed { reason },
            VcsError::CommandFailed { command, reason } => Self::Backend {
                reason: format!("{command}: {reason}"),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("invalid scope pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("agent binary '{program}' could not be started: {reason}")]
    Spawn { program: String, reason: String },
    #[error("agent process io error: {reason}")]
    Io { reason: String },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl From<fm_vcs::backend::VcsError> for EngineError {
    fn from(value: fm_vcs::backend::VcsError) -> Self {
        Self::Workspace(WorkspaceError::from(value))
    }
}

use thiserror::Error;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("repository root is not a git work tree")]
    NotAWorkTree,
    #[error("working tree has uncommitted changes")]
    DirtyWorkTree,
    #[error("base branch '{name}' does not exist")]
    BaseBranchMissing { name: String },
    #[error("unable to fast-forward '{base}' to '{branch}': {reason}")]
    FastForwardFailed {
        base: String,
        branch: String,
        reason: String,
    },
    #[error("git {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },
}

/// Branch-isolation settings. `disabled` bypasses the whole protocol and
/// `dry_run` logs every mutating git call instead of executing it; both exist
/// as escape hatches and reduce the safety the protocol provides.
#[derive(Debug, Clone)]
pub struct BranchConfig {
    pub base_branch: String,
    pub branch_prefix: String,
    pub slug_words: usize,
    pub slug_chars: usize,
    pub cleanup_enabled: bool,
    pub allow_dirty: bool,
    pub dry_run: bool,
    pub disabled: bool,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            base_branch: "main".to_string(),
            branch_prefix: "foreman/prompt".to_string(),
            slug_words: 6,
            slug_chars: 48,
            cleanup_enabled: true,
            allow_dirty: false,
            dry_run: false,
            disabled: false,
        }
    }
}

/// State of one prepared prompt branch, handed back to `finalize`.
#[derive(Debug, Clone)]
pub struct BranchSession {
    pub branch_name: String,
    pub slug: String,
    pub base_branch: String,
    pub base_commit: String,
    pub notes: Vec<String>,
}

/// What finalization did, for the attempt transcript.
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub merged_commits: Vec<String>,
    pub notes: Vec<String>,
}

use crate::backend::{BranchConfig, BranchSession, CleanupOutcome, VcsError};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Branch-isolation workflow over a git checkout.
///
/// Every attempt runs on its own branch cut from the configured base branch;
/// a clean finish fast-forwards the base onto the attempt's commits and
/// deletes the branch, while a dirty finish leaves everything in place for
/// inspection.
pub struct GitWorkspace {
    repo_root: PathBuf,
    config: BranchConfig,
}

impl GitWorkspace {
    pub fn new(repo_root: impl Into<PathBuf>, config: BranchConfig) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
        }
    }

    pub fn config(&self) -> &BranchConfig {
        &self.config
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    /// Preflight and branch creation. Returns `None` when branch isolation is
    /// disabled by configuration.
    pub fn prepare(
        &self,
        prompt_id: &str,
        prompt_text: &str,
    ) -> Result<Option<BranchSession>, VcsError> {
        if self.config.disabled {
            return Ok(None);
        }
        self.ensure_work_tree()?;
        if !self.config.allow_dirty && self.is_dirty()? {
            return Err(VcsError::DirtyWorkTree);
        }
        let slug = slugify(prompt_text, self.config.slug_words, self.config.slug_chars);
        let branch_name = format!("{}-{}-{}", self.config.branch_prefix, prompt_id, slug);
        if !self.ref_exists(&self.config.base_branch)? {
            return Err(VcsError::BaseBranchMissing {
                name: self.config.base_branch.clone(),
            });
        }
        let base_commit = self.rev_parse(&self.config.base_branch)?;
        tracing::info!(branch = %branch_name, base = %self.config.base_branch, "preparing prompt branch");

        let mut session = BranchSession {
            branch_name,
            slug,
            base_branch: self.config.base_branch.clone(),
            base_commit,
            notes: Vec::new(),
        };
        self.git_mut(&["switch", &self.config.base_branch])?;
        if self.ref_exists(&session.branch_name)? {
            self.git_mut(&["branch", "-D", &session.branch_name])?;
            session
                .notes
                .push(format!("removed stale branch {}", session.branch_name));
        }
        self.git_mut(&[
            "switch",
            "-C",
            &session.branch_name,
            &self.config.base_branch,
        ])?;
        session.notes.push(format!(
            "checked out {} from {}",
            session.branch_name, session.base_branch
        ));
        Ok(Some(session))
    }

    /// Cleanup after the external process has returned. Requires a clean tree:
    /// whatever the attempt wanted to keep must already be committed. Never
    /// deletes anything when the tree is dirty.
    pub fn finalize(&self, session: &BranchSession) -> Result<CleanupOutcome, VcsError> {
        let mut outcome = CleanupOutcome::default();
        if !self.config.cleanup_enabled {
            outcome.notes.push(format!(
                "cleanup disabled by config; leaving {} checked out",
                session.branch_name
            ));
            return Ok(outcome);
        }
        if self.is_dirty()? {
            return Err(VcsError::DirtyWorkTree);
        }
        self.git_mut(&["switch", &session.base_branch])?;
        if !self.ref_exists(&session.branch_name)? {
            outcome.notes.push(format!(
                "branch {} no longer exists; nothing to merge",
                session.branch_name
            ));
            return Ok(outcome);
        }
        let base_head = self.rev_parse(&session.base_branch)?;
        let branch_head = self.rev_parse(&session.branch_name)?;
        if branch_head != base_head {
            let commits = self.list_commits(&base_head, &branch_head)?;
            self.git_mut(&["merge", "--ff-only", &session.branch_name])
                .map_err(|err| VcsError::FastForwardFailed {
                    base: session.base_branch.clone(),
                    branch: session.branch_name.clone(),
                    reason: err.to_string(),
                })?;
            if commits.is_empty() {
                outcome.notes.push(format!(
                    "{} already included {}",
                    session.base_branch, session.branch_name
                ));
            } else {
                outcome.notes.push(format!(
                    "merged {} ({} commit{}) into {}",
                    session.branch_name,
                    commits.len(),
                    if commits.len() == 1 { "" } else { "s" },
                    session.base_branch
                ));
            }
            outcome.merged_commits = commits;
        } else {
            outcome.notes.push(format!(
                "{} already up to date with {}",
                session.base_branch, session.branch_name
            ));
        }
        self.git_mut(&["branch", "-D", &session.branch_name])?;
        outcome.notes.push(format!(
            "deleted {}; workspace reset to {}",
            session.branch_name, session.base_branch
        ));
        Ok(outcome)
    }

    pub fn is_dirty(&self) -> Result<bool, VcsError> {
        let out = self.git(&["status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    pub fn head_commit(&self) -> Result<String, VcsError> {
        self.rev_parse("HEAD")
    }

    /// Paths touched since `base_commit`: commits on top of it plus anything
    /// still uncommitted in the tree.
    pub fn changed_paths_since(&self, base_commit: &str) -> Result<Vec<String>, VcsError> {
        let mut paths = Vec::new();
        let head = self.head_commit()?;
        if head != base_commit {
            let range = format!("{base_commit}..HEAD");
            let out = self.git(&["diff", "--name-only", &range])?;
            paths.extend(out.lines().map(str::trim).filter(|l| !l.is_empty()).map(String::from));
        }
        // --untracked-files=all lists files inside untracked directories
        // individually instead of the directory alone.
        let status = self.git(&["status", "--porcelain", "-z", "--untracked-files=all"])?;
        paths.extend(parse_porcelain_z(&status));
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    /// Content of `path` as of `commit`, or `None` if the commit has no such
    /// path.
    pub fn file_at(&self, commit: &str, path: &str) -> Result<Option<Vec<u8>>, VcsError> {
        let spec = format!("{commit}:{path}");
        let output = self.raw(&["show", &spec])?;
        if output.status.success() {
            Ok(Some(output.stdout))
        } else {
            Ok(None)
        }
    }

    /// Restore `paths` to their content at `commit`; paths the commit never
    /// had are removed from the working tree instead.
    pub fn restore_paths(&self, commit: &str, paths: &[String]) -> Result<(), VcsError> {
        for path in paths {
            if self.config.dry_run {
                tracing::info!(%commit, %path, "[dry-run] git checkout -- path");
                continue;
            }
            let restored = self
                .raw(&["checkout", commit, "--", path])
                .map(|out| out.status.success())
                .unwrap_or(false);
            if !restored {
                let target = self.repo_root.join(path);
                if target.is_dir() {
                    let _ = std::fs::remove_dir_all(&target);
                } else {
                    let _ = std::fs::remove_file(&target);
                }
            }
        }
        Ok(())
    }

    fn ensure_work_tree(&self) -> Result<(), VcsError> {
        let out = self
            .git(&["rev-parse", "--is-inside-work-tree"])
            .map_err(|_| VcsError::NotAWorkTree)?;
        if out.trim() == "true" {
            Ok(())
        } else {
            Err(VcsError::NotAWorkTree)
        }
    }

    fn ref_exists(&self, name: &str) -> Result<bool, VcsError> {
        let rev = format!("refs/heads/{name}");
        let output = self.raw(&["rev-parse", "--verify", "--quiet", &rev])?;
        Ok(output.status.success())
    }

    fn rev_parse(&self, rev: &str) -> Result<String, VcsError> {
        let out = self.git(&["rev-parse", rev])?;
        let sha = out.trim().to_string();
        if sha.is_empty() {
            return Err(VcsError::CommandFailed {
                command: format!("rev-parse {rev}"),
                reason: "empty output".to_string(),
            });
        }
        Ok(sha)
    }

    fn list_commits(&self, start: &str, end: &str) -> Result<Vec<String>, VcsError> {
        if start == end {
            return Ok(Vec::new());
        }
        let range = format!("{start}..{end}");
        let out = self.git(&["rev-list", "--reverse", &range])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    /// Run git, demanding success; stdout as a string.
    fn git(&self, args: &[&str]) -> Result<String, VcsError> {
        let output = self.raw(args)?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let reason = if stderr.is_empty() { stdout } else { stderr };
            Err(VcsError::CommandFailed {
                command: args.join(" "),
                reason: if reason.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    reason
                },
            })
        }
    }

    /// Run a mutating git command, honoring dry-run.
    fn git_mut(&self, args: &[&str]) -> Result<(), VcsError> {
        if self.config.dry_run {
            tracing::info!(command = %args.join(" "), "[dry-run] git");
            return Ok(());
        }
        self.git(args).map(|_| ())
    }

    fn raw(&self, args: &[&str]) -> Result<Output, VcsError> {
        Command::new("git")
            .current_dir(&self.repo_root)
            .args(args)
            .output()
            .map_err(|err| VcsError::CommandFailed {
                command: args.first().copied().unwrap_or("").to_string(),
                reason: err.to_string(),
            })
    }
}

/// Deterministic branch slug from the leading words of the prompt text.
pub fn slugify(text: &str, max_words: usize, max_chars: usize) -> String {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();
    let taken = if max_words > 0 {
        &words[..words.len().min(max_words)]
    } else {
        &words[..]
    };
    let mut slug = taken.join("-");
    slug.truncate(max_chars);
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        "update".to_string()
    } else {
        slug
    }
}

/// NUL-separated `status --porcelain -z` entries; rename/copy records carry
/// the original path as a trailing extra entry which must be skipped.
fn parse_porcelain_z(raw: &str) -> Vec<String> {
    let mut paths = Vec::new();
    let mut parts = raw.split('\0').filter(|entry| !entry.is_empty());
    while let Some(entry) = parts.next() {
        if entry.len() < 4 {
            continue;
        }
        let (code, path) = entry.split_at(3);
        paths.push(path.to_string());
        if code.starts_with('R') || code.starts_with('C') {
            let _ = parts.next();
        }
    }
    paths
}

use crate::error::EngineError;
use crate::runner::RunnerConfig;
use fm_vcs::backend::BranchConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Everything the engine needs to know about its environment. Assembled by
/// the binary from CLI flags and `FOREMAN_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Repository the agent works in; also the process working directory.
    pub repo_root: PathBuf,
    /// Holds `prompts.json`, `transcripts/` and `scope_violations.log`.
    pub data_dir: PathBuf,
    /// Per-project metadata, context and scope manifests.
    pub projects_dir: PathBuf,
    pub default_project: Option<String>,
    pub agent_bin: String,
    /// Argument string, split with shell quoting rules.
    pub agent_args: String,
    /// Optional sandbox mode forwarded as `--sandbox <mode>`.
    pub sandbox: Option<String>,
    pub grace_secs: u64,
    pub heartbeat_secs: u64,
    pub bus_capacity: usize,
    pub branch: BranchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            repo_root: PathBuf::from("."),
            data_dir: PathBuf::from(".foreman"),
            projects_dir: PathBuf::from("projects"),
            default_project: None,
            agent_bin: "codex".to_string(),
            agent_args: "exec --skip-git-repo-check -".to_string(),
            sandbox: None,
            grace_secs: 5,
            heartbeat_secs: 10,
            bus_capacity: 1024,
            branch: BranchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn prompt_db_path(&self) -> PathBuf {
        self.data_dir.join("prompts.json")
    }

    pub fn transcripts_dir(&self) -> PathBuf {
        self.data_dir.join("transcripts")
    }

    pub fn violation_log_path(&self) -> PathBuf {
        self.data_dir.join("scope_violations.log")
    }

    /// Resolve the agent invocation. The sandbox flag slots in before a
    /// trailing `-` (stdin marker) so the prompt stays the last argument.
    pub fn runner_config(&self) -> Result<RunnerConfig, EngineError> {
        let mut args =
            shell_words::split(&self.agent_args).map_err(|err| EngineError::Internal {
                message: format!("invalid agent argument string: {err}"),
            })?;
        if let Some(mode) = &self.sandbox {
            let at = if args.last().is_some_and(|last| last == "-") {
                args.len() - 1
            } else {
                args.len()
            };
            args.splice(at..at, ["--sandbox".to_string(), mode.clone()]);
        }
        Ok(RunnerConfig {
            program: self.agent_bin.clone(),
            args,
            grace: Duration::from_secs(self.grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_flag_lands_before_stdin_marker() {
        let config = EngineConfig {
            sandbox: Some("workspace-write".to_string()),
            ..EngineConfig::default()
        };
        let runner = config.runner_config().unwrap();
        assert_eq!(
            runner.args,
            vec![
                "exec",
                "--skip-git-repo-check",
                "--sandbox",
                "workspace-write",
                "-"
            ]
        );
    }

    #[test]
    fn sandbox_flag_appends_without_marker() {
        let config = EngineConfig {
            agent_args: "run".to_string(),
            sandbox: Some("strict".to_string()),
            ..EngineConfig::default()
        };
        let runner = config.runner_config().unwrap();
        assert_eq!(runner.args, vec!["run", "--sandbox", "strict"]);
    }
}

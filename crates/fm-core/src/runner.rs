use crate::error::RunnerError;
use crate::types::enums::StreamKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub program: String,
    pub args: Vec<String>,
    /// How long a graceful termination may take before escalating to a kill.
    pub grace: Duration,
}

/// One streamed output line. `seq` increases monotonically per stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: StreamKind,
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessResult {
    pub exit_code: Option<i32>,
    pub canceled: bool,
}

/// Spawns the external agent binary, feeds it the prompt on stdin, and
/// streams its output. Cancellation is cooperative: a watch flag triggers a
/// graceful stop that escalates to a kill after the grace period.
pub struct ProcessRunner {
    config: RunnerConfig,
    work_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(config: RunnerConfig, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            work_dir: work_dir.into(),
        }
    }

    /// Verify the agent binary can be started at all, so a misconfigured
    /// binary fails the attempt before any branch work happens.
    pub fn preflight(&self) -> Result<(), RunnerError> {
        if resolve_program(&self.config.program).is_some() {
            Ok(())
        } else {
            Err(RunnerError::Spawn {
                program: self.config.program.clone(),
                reason: "not found or not executable".to_string(),
            })
        }
    }

    pub async fn run(
        &self,
        input: &str,
        mut cancel: watch::Receiver<bool>,
        chunks: mpsc::UnboundedSender<OutputChunk>,
    ) -> Result<ProcessResult, RunnerError> {
        if *cancel.borrow() {
            return Ok(ProcessResult {
                exit_code: None,
                canceled: true,
            });
        }

        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|err| RunnerError::Spawn {
            program: self.config.program.clone(),
            reason: err.to_string(),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|err| RunnerError::Io {
                    reason: format!("writing prompt to stdin: {err}"),
                })?;
        }

        let stdout_pump = child
            .stdout
            .take()
            .map(|stream| tokio::spawn(pump(stream, StreamKind::Stdout, chunks.clone())));
        let stderr_pump = child
            .stderr
            .take()
            .map(|stream| tokio::spawn(pump(stream, StreamKind::Stderr, chunks.clone())));
        drop(chunks);

        let mut canceled = false;
        let status = tokio::select! {
            status = child.wait() => status.map_err(|err| RunnerError::Io {
                reason: err.to_string(),
            })?,
            () = cancel_requested(&mut cancel) => {
                canceled = true;
                self.shutdown(&mut child).await?
            }
        };

        if let Some(task) = stdout_pump {
            let _ = task.await;
        }
        if let Some(task) = stderr_pump {
            let _ = task.await;
        }

        Ok(ProcessResult {
            exit_code: status.code(),
            canceled,
        })
    }

    /// Graceful signal first, forced kill once the grace period elapses.
    async fn shutdown(&self, child: &mut Child) -> Result<std::process::ExitStatus, RunnerError> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id()
                && let Ok(raw) = i32::try_from(pid)
            {
                let _ = kill(Pid::from_raw(raw), Signal::SIGTERM);
                if let Ok(result) = tokio::time::timeout(self.config.grace, child.wait()).await {
                    return result.map_err(|err| RunnerError::Io {
                        reason: err.to_string(),
                    });
                }
                tracing::warn!(
                    grace_secs = self.config.grace.as_secs(),
                    "agent ignored SIGTERM; killing"
                );
            }
        }
        child.start_kill().map_err(|err| RunnerError::Io {
            reason: err.to_string(),
        })?;
        child.wait().await.map_err(|err| RunnerError::Io {
            reason: err.to_string(),
        })
    }
}

async fn cancel_requested(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone without a cancellation; never resolve.
            std::future::pending::<()>().await;
        }
    }
}

async fn pump(
    stream: impl AsyncRead + Unpin,
    kind: StreamKind,
    sender: mpsc::UnboundedSender<OutputChunk>,
) {
    let mut lines = BufReader::new(stream).lines();
    let mut seq = 0u64;
    while let Ok(Some(line)) = lines.next_line().await {
        seq += 1;
        let chunk = OutputChunk {
            stream: kind,
            seq,
            text: format!("{line}\n"),
        };
        if sender.send(chunk).is_err() {
            break;
        }
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::metadata(path)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

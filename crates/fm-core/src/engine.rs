use crate::config::EngineConfig;
use crate::error::{EngineError, RunnerError, StoreError, WorkspaceError};
use crate::projects::ProjectRegistry;
use crate::runner::{OutputChunk, ProcessRunner};
use crate::scope::{ScopeEnforcer, ScopeViolationRecord};
use crate::store::{AttemptFooter, PromptStore, TranscriptStore, TransitionFields, ViolationLog};
use crate::types::enums::{AttemptOutcome, ErrorKind, PromptStatus, StreamKind};
use crate::types::event::{EventBody, StreamChunk};
use crate::types::ids::{ProjectId, PromptId};
use crate::types::io::{HealthSnapshot, QueueSnapshot};
use crate::types::prompt::{Attempt, Prompt};
use crate::types::scope::ScopeManifest;
use chrono::Utc;
use fm_events::bus::EventBus;
use fm_vcs::git::GitWorkspace;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tracing::{error, info, warn};

struct RestartingMark {
    summary: String,
    requires_follow_up: bool,
}

/// Cancellation and restart state for the one in-flight attempt.
struct ActiveRun {
    id: PromptId,
    cancel: watch::Sender<bool>,
    restart: bool,
    restarting: Option<RestartingMark>,
}

struct AttemptEnd {
    status: PromptStatus,
}

/// The single orchestrator. All external calls funnel through it; the run
/// loop owns the one execution slot, so at most one prompt is running
/// system-wide and the working tree belongs to that attempt alone.
pub struct Engine<S: PromptStore> {
    store: Arc<S>,
    bus: EventBus,
    workspace: GitWorkspace,
    registry: ProjectRegistry,
    runner: ProcessRunner,
    transcripts: Arc<dyn TranscriptStore>,
    violations: Arc<dyn ViolationLog>,
    config: EngineConfig,
    queue_wakeup: Notify,
    active: Mutex<Option<ActiveRun>>,
}

impl<S: PromptStore> Engine<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<S>,
        bus: EventBus,
        workspace: GitWorkspace,
        registry: ProjectRegistry,
        runner: ProcessRunner,
        transcripts: Arc<dyn TranscriptStore>,
        violations: Arc<dyn ViolationLog>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            bus,
            workspace,
            registry,
            runner,
            transcripts,
            violations,
            config,
            queue_wakeup: Notify::new(),
            active: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn transcripts(&self) -> &dyn TranscriptStore {
        self.transcripts.as_ref()
    }

    // ------------------------------------------------------------------
    // External operations
    // ------------------------------------------------------------------

    pub fn enqueue(
        &self,
        text: &str,
        project_id: Option<ProjectId>,
    ) -> Result<Prompt, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidInput {
                message: "prompt text is required".to_string(),
            }
            .into());
        }
        let project_id = self.registry.resolve_project_id(project_id.as_ref());
        let prompt = self.store.enqueue(trimmed, project_id)?;
        info!(prompt = %prompt.id, "queued prompt");
        self.queue_wakeup.notify_one();
        self.publish_prompt(&prompt);
        self.publish_snapshot();
        self.publish_health();
        Ok(prompt)
    }

    pub fn get(&self, id: &PromptId) -> Result<Option<Prompt>, EngineError> {
        Ok(self.store.get(id)?)
    }

    pub fn list(&self) -> Result<Vec<Prompt>, EngineError> {
        Ok(self.store.list()?)
    }

    pub fn snapshot(&self) -> Result<QueueSnapshot, EngineError> {
        Ok(self.store.snapshot()?)
    }

    pub fn health(&self) -> Result<HealthSnapshot, EngineError> {
        Ok(self.store.health()?)
    }

    pub fn edit_text(&self, id: &PromptId, text: &str) -> Result<Prompt, EngineError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(StoreError::InvalidInput {
                message: "prompt text is required".to_string(),
            }
            .into());
        }
        let prompt = self.store.edit_text(id, trimmed)?;
        info!(prompt = %id, "edited prompt text");
        self.publish_prompt(&prompt);
        self.publish_snapshot();
        Ok(prompt)
    }

    pub fn delete(&self, id: &PromptId) -> Result<Prompt, EngineError> {
        let removed = self.store.delete(id)?;
        if let Err(err) = self.transcripts.remove(id) {
            warn!(prompt = %id, %err, "unable to remove transcript");
        }
        info!(prompt = %id, "deleted prompt");
        self.publish_body(&EventBody::PromptDeleted {
            prompt_id: id.clone(),
        });
        self.publish_snapshot();
        self.publish_health();
        Ok(removed)
    }

    /// Requeue a failed or canceled prompt at the back of the FIFO.
    pub fn retry(&self, id: &PromptId) -> Result<Prompt, EngineError> {
        let prompt = self.store.get(id)?.ok_or(StoreError::NotFound)?;
        if !matches!(
            prompt.status,
            PromptStatus::Failed | PromptStatus::Canceled
        ) {
            return Err(StoreError::InvalidState {
                message: "retry is only valid for failed or canceled prompts".to_string(),
            }
            .into());
        }
        let updated = self
            .store
            .transition(id, PromptStatus::Queued, TransitionFields::default())?;
        info!(prompt = %id, "requeued prompt");
        self.queue_wakeup.notify_one();
        self.publish_prompt(&updated);
        self.publish_snapshot();
        self.publish_health();
        Ok(updated)
    }

    /// Ask the running prompt to stop. With `restart` the prompt is
    /// re-enqueued as soon as cancellation completes.
    pub fn cancel(&self, id: &PromptId, restart: bool) -> Result<Prompt, EngineError> {
        let prompt = self.store.get(id)?.ok_or(StoreError::NotFound)?;
        if prompt.status != PromptStatus::Running {
            return Err(StoreError::InvalidState {
                message: "prompt is not running".to_string(),
            }
            .into());
        }
        {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(run) if run.id == *id => {
                    run.restart = restart;
                    let _ = run.cancel.send(true);
                }
                _ => {
                    return Err(StoreError::InvalidState {
                        message: "prompt is no longer running".to_string(),
                    }
                    .into());
                }
            }
        }
        let updated = self.store.set_cancel_requested(id, true)?;
        info!(prompt = %id, restart, "cancellation requested");
        self.publish_prompt(&updated);
        Ok(updated)
    }

    /// Flag the running prompt ahead of an operator-initiated restart of the
    /// host process. The attempt finalizes as `server_restarting` instead of
    /// failed, and recovery completes or resumes it on the next boot.
    pub fn mark_server_restarting(
        &self,
        id: &PromptId,
        summary: &str,
        requires_follow_up: bool,
    ) -> Result<Prompt, EngineError> {
        let prompt = self.store.get(id)?.ok_or(StoreError::NotFound)?;
        if prompt.status != PromptStatus::Running {
            return Err(StoreError::InvalidState {
                message: "only a running prompt can be marked for a server restart".to_string(),
            }
            .into());
        }
        {
            let mut active = self.lock_active();
            match active.as_mut() {
                Some(run) if run.id == *id => {
                    run.restarting = Some(RestartingMark {
                        summary: summary.to_string(),
                        requires_follow_up,
                    });
                }
                _ => {
                    return Err(StoreError::InvalidState {
                        message: "prompt is no longer running".to_string(),
                    }
                    .into());
                }
            }
        }
        let updated = self.store.transition(
            id,
            PromptStatus::ServerRestarting,
            TransitionFields {
                result_summary: Some(summary.to_string()),
                requires_follow_up: Some(requires_follow_up),
            },
        )?;
        info!(prompt = %id, requires_follow_up, "marked for server restart");
        self.publish_prompt(&updated);
        self.publish_snapshot();
        Ok(updated)
    }

    /// Run crash recovery over the store and publish the resulting updates.
    /// Must run before the scheduler loop starts consuming.
    pub fn reconcile_on_boot(&self) -> Result<Vec<Prompt>, EngineError> {
        let recovered =
            crate::recovery::reconcile_on_boot(self.store.as_ref(), self.transcripts.as_ref())?;
        if !recovered.is_empty() {
            for prompt in &recovered {
                self.publish_prompt(prompt);
            }
            self.publish_snapshot();
            self.publish_health();
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Scheduler loop
    // ------------------------------------------------------------------

    /// The serialized scheduler: one queued prompt at a time, FIFO by
    /// `enqueued_at`. A failed attempt never terminates the loop.
    pub async fn run(self: Arc<Self>) {
        loop {
            let next = match self.store.next_queued() {
                Ok(next) => next,
                Err(err) => {
                    error!(%err, "unable to read queue");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let Some(prompt) = next else {
                let _ = tokio::time::timeout(
                    Duration::from_secs(1),
                    self.queue_wakeup.notified(),
                )
                .await;
                continue;
            };
            Arc::clone(&self).execute(prompt).await;
        }
    }

    /// Periodic health publisher; independent of the scheduler and only ever
    /// takes read-only snapshots.
    pub async fn heartbeat(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.heartbeat_secs.max(1));
        loop {
            self.publish_health();
            tokio::time::sleep(interval).await;
        }
    }

    async fn execute(self: Arc<Self>, prompt: Prompt) {
        let id = prompt.id.clone();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        {
            let mut active = self.lock_active();
            *active = Some(ActiveRun {
                id: id.clone(),
                cancel: cancel_tx,
                restart: false,
                restarting: None,
            });
        }

        let end = Arc::clone(&self).run_attempt(&prompt, cancel_rx).await;

        let restart = {
            let mut active = self.lock_active();
            active.take().is_some_and(|run| run.restart)
        };

        match end {
            Ok(end) => {
                if end.status == PromptStatus::Canceled && restart {
                    match self
                        .store
                        .transition(&id, PromptStatus::Queued, TransitionFields::default())
                    {
                        Ok(updated) => {
                            info!(prompt = %id, "re-queued after cancellation");
                            self.queue_wakeup.notify_one();
                            self.publish_prompt(&updated);
                            self.publish_snapshot();
                        }
                        Err(err) => {
                            warn!(prompt = %id, %err, "unable to re-queue after cancellation");
                        }
                    }
                }
            }
            Err(err) => {
                // The loop survives; park the prompt as failed if possible.
                error!(prompt = %id, %err, "attempt aborted by engine error");
                let _ = self.store.transition(
                    &id,
                    PromptStatus::Failed,
                    TransitionFields {
                        result_summary: Some(format!("engine error: {err}")),
                        requires_follow_up: None,
                    },
                );
                self.publish_snapshot();
            }
        }
    }

    async fn run_attempt(
        self: Arc<Self>,
        prompt: &Prompt,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<AttemptEnd, EngineError> {
        let id = &prompt.id;
        let sequence = u32::try_from(prompt.attempts.len())
            .unwrap_or(u32::MAX)
            .saturating_add(1);

        self.store
            .transition(id, PromptStatus::Running, TransitionFields::default())?;
        let running = self.store.append_attempt(id, Attempt::open(sequence))?;
        info!(prompt = %id, attempt = sequence, "processing prompt");
        self.publish_prompt(&running);
        self.publish_snapshot();
        self.publish_health();

        let manifest = self.registry.scope_for(prompt.project_id.as_ref());
        let context = self.registry.context_for(prompt.project_id.as_ref());
        if let Err(err) = self
            .transcripts
            .begin_attempt(id, sequence, &prompt.text, &context)
        {
            warn!(prompt = %id, %err, "unable to open transcript");
        }
        self.publish_stream_marker(id, sequence, true, false);

        let mut notes: Vec<String> = Vec::new();
        let mut runner_failure: Option<RunnerError> = None;
        let mut workspace_failure: Option<WorkspaceError> = None;
        let mut violations: Vec<String> = Vec::new();
        let mut exit_code: Option<i32> = None;
        let mut canceled = false;

        // The binary is checked before any branch work so a misconfigured
        // agent leaves no workspace side effects.
        if let Err(err) = self.runner.preflight() {
            notes.push(err.to_string());
            runner_failure = Some(err);
        }

        let mut session = None;
        let mut snapshot_commit = None;
        if runner_failure.is_none() {
            match self.workspace.prepare(id.as_str(), &prompt.text) {
                Ok(Some(prepared)) => {
                    self.store
                        .set_branch(id, Some(prepared.branch_name.clone()))?;
                    notes.extend(prepared.notes.clone());
                    snapshot_commit = Some(prepared.base_commit.clone());
                    session = Some(prepared);
                }
                Ok(None) => {
                    notes.push("branch isolation disabled by config".to_string());
                    snapshot_commit = self.workspace.head_commit().ok();
                }
                Err(err) => {
                    notes.push(format!("git branch preparation failed: {err}"));
                    workspace_failure = Some(err.into());
                }
            }
        }

        if runner_failure.is_none() && workspace_failure.is_none() {
            let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
            let forward = tokio::spawn(forward_chunks(
                Arc::clone(&self),
                id.clone(),
                sequence,
                chunk_rx,
            ));
            match self.runner.run(&prompt.text, cancel_rx, chunk_tx).await {
                Ok(result) => {
                    exit_code = result.exit_code;
                    canceled = result.canceled;
                }
                Err(err) => {
                    notes.push(err.to_string());
                    runner_failure = Some(err);
                }
            }
            let _ = forward.await;
        }

        // Scope enforcement over the whole edit batch, including a canceled
        // run's partial edits.
        if let Some(base) = snapshot_commit.as_deref() {
            match self.enforce_scope(prompt, &manifest, base) {
                Ok(reverted) => {
                    if !reverted.is_empty() {
                        notes.push(format!(
                            "scope guard reverted {} path(s): {}",
                            reverted.len(),
                            reverted.join(", ")
                        ));
                    }
                    violations = reverted;
                }
                Err(err) => {
                    warn!(prompt = %id, %err, "scope review failed");
                    notes.push(format!("scope review failed: {err}"));
                }
            }
        }

        if let Some(prepared) = &session {
            match self.workspace.finalize(prepared) {
                Ok(outcome) => {
                    notes.extend(outcome.notes);
                    if self.workspace.config().cleanup_enabled {
                        self.store.set_branch(id, None)?;
                    }
                }
                Err(err) => {
                    notes.push(format!("git cleanup blocked: {err}"));
                    if workspace_failure.is_none() {
                        workspace_failure = Some(err.into());
                    }
                }
            }
        }

        let restarting = {
            let mut active = self.lock_active();
            active
                .as_mut()
                .filter(|run| run.id == *id)
                .and_then(|run| run.restarting.take())
        };

        let (status, outcome, error_kind, summary) = if let Some(mark) = restarting {
            (
                PromptStatus::ServerRestarting,
                AttemptOutcome::ServerRestarting,
                None,
                mark.summary,
            )
        } else if canceled {
            (
                PromptStatus::Canceled,
                AttemptOutcome::Canceled,
                None,
                "prompt canceled by operator".to_string(),
            )
        } else if !violations.is_empty() {
            // A violation outranks the dirty tree its own revert can leave
            // behind; the branch stays checked out for inspection either way.
            (
                PromptStatus::Failed,
                AttemptOutcome::Failed,
                Some(ErrorKind::ScopeViolation),
                format!(
                    "scope guard blocked edits to disallowed paths: {}",
                    violations.join(", ")
                ),
            )
        } else if let Some(err) = &workspace_failure {
            (
                PromptStatus::Failed,
                AttemptOutcome::Failed,
                Some(ErrorKind::WorkspaceDirty),
                err.to_string(),
            )
        } else if let Some(err) = &runner_failure {
            (
                PromptStatus::Failed,
                AttemptOutcome::Failed,
                Some(ErrorKind::SpawnFailed),
                err.to_string(),
            )
        } else if exit_code != Some(0) {
            (
                PromptStatus::Failed,
                AttemptOutcome::Failed,
                Some(ErrorKind::NonzeroExit),
                format!("agent exited with code {}", exit_code.unwrap_or(-1)),
            )
        } else {
            (
                PromptStatus::Completed,
                AttemptOutcome::Completed,
                None,
                "agent run succeeded".to_string(),
            )
        };

        let attempt = self.close_attempt(id, sequence, outcome, error_kind, exit_code, &summary)?;
        let footer = AttemptFooter {
            outcome,
            exit_code,
            duration_secs: attempt.duration_secs.unwrap_or(0.0),
            summary: summary.clone(),
            workflow_notes: notes,
            finished_at: attempt.finished_at.unwrap_or_else(Utc::now),
        };
        if let Err(err) = self.transcripts.close_attempt(id, sequence, &footer) {
            warn!(prompt = %id, %err, "unable to close transcript");
        }
        self.publish_stream_marker(id, sequence, false, true);

        let requires_follow_up = (status == PromptStatus::ServerRestarting)
            .then(|| self.store.get(id).ok().flatten().map(|p| p.requires_follow_up))
            .flatten();
        let updated = self.store.transition(
            id,
            status,
            TransitionFields {
                result_summary: Some(summary.clone()),
                requires_follow_up,
            },
        )?;
        match status {
            PromptStatus::Completed => info!(prompt = %id, "prompt completed"),
            PromptStatus::Canceled => info!(prompt = %id, "prompt canceled"),
            PromptStatus::ServerRestarting => {
                info!(prompt = %id, "prompt parked for server restart");
            }
            _ => error!(prompt = %id, %summary, "prompt failed"),
        }
        self.publish_prompt(&updated);
        self.publish_snapshot();
        self.publish_health();

        Ok(AttemptEnd { status })
    }

    fn close_attempt(
        &self,
        id: &PromptId,
        sequence: u32,
        outcome: AttemptOutcome,
        error_kind: Option<ErrorKind>,
        exit_code: Option<i32>,
        summary: &str,
    ) -> Result<Attempt, EngineError> {
        let prompt = self.store.get(id)?.ok_or(StoreError::NotFound)?;
        let mut attempt = prompt
            .attempts
            .iter()
            .find(|attempt| attempt.sequence == sequence)
            .cloned()
            .ok_or_else(|| EngineError::Internal {
                message: format!("attempt {sequence} missing for prompt {id}"),
            })?;
        attempt.close(outcome, error_kind, exit_code, summary);
        self.store.update_attempt(id, attempt.clone())?;
        Ok(attempt)
    }

    fn enforce_scope(
        &self,
        prompt: &Prompt,
        manifest: &ScopeManifest,
        base_commit: &str,
    ) -> Result<Vec<String>, EngineError> {
        let enforcer = ScopeEnforcer::new(manifest.clone())?;
        let changed = self.workspace.changed_paths_since(base_commit)?;
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        let violations = enforcer.review(
            &changed,
            |path| self.workspace.file_at(base_commit, path).ok().flatten(),
            |path| std::fs::read(self.workspace.repo_root().join(path)).ok(),
        );
        if violations.is_empty() {
            return Ok(violations);
        }
        warn!(
            prompt = %prompt.id,
            count = violations.len(),
            "reverting out-of-scope edits"
        );
        self.workspace.restore_paths(base_commit, &violations)?;
        let timestamp = Utc::now();
        for path in &violations {
            let record = ScopeViolationRecord {
                timestamp,
                prompt_id: prompt.id.clone(),
                project_id: prompt.project_id.clone(),
                path: path.clone(),
                context: "post-run diff".to_string(),
            };
            if let Err(err) = self.violations.append(&record) {
                warn!(prompt = %prompt.id, %err, "unable to append violation record");
            }
        }
        Ok(violations)
    }

    // ------------------------------------------------------------------
    // Event publication
    // ------------------------------------------------------------------

    fn publish_body(&self, body: &EventBody) {
        match serde_json::to_value(body) {
            Ok(value) => {
                self.bus.publish(value);
            }
            Err(err) => warn!(%err, "unable to serialize event"),
        }
    }

    fn publish_prompt(&self, prompt: &Prompt) {
        self.publish_body(&EventBody::PromptUpdate {
            prompt: prompt.clone(),
        });
    }

    fn publish_snapshot(&self) {
        match self.store.snapshot() {
            Ok(snapshot) => self.publish_body(&EventBody::QueueSnapshot { snapshot }),
            Err(err) => warn!(%err, "unable to build queue snapshot"),
        }
    }

    fn publish_health(&self) {
        match self.store.health() {
            Ok(health) => self.publish_body(&EventBody::Health { health }),
            Err(err) => warn!(%err, "unable to build health snapshot"),
        }
    }

    fn publish_stream_marker(&self, id: &PromptId, attempt: u32, reset: bool, done: bool) {
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            self.publish_body(&EventBody::PromptStream {
                chunk: StreamChunk {
                    prompt_id: id.clone(),
                    attempt,
                    stream,
                    seq: 0,
                    chunk: String::new(),
                    reset,
                    done,
                    at: Utc::now(),
                },
            });
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, Option<ActiveRun>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn forward_chunks<S: PromptStore>(
    engine: Arc<Engine<S>>,
    id: PromptId,
    attempt: u32,
    mut chunks: mpsc::UnboundedReceiver<OutputChunk>,
) {
    while let Some(chunk) = chunks.recv().await {
        if let Err(err) = engine
            .transcripts
            .append_chunk(&id, attempt, chunk.stream, &chunk.text)
        {
            warn!(prompt = %id, %err, "unable to persist output chunk");
        }
        engine.publish_body(&EventBody::PromptStream {
            chunk: StreamChunk {
                prompt_id: id.clone(),
                attempt,
                stream: chunk.stream,
                seq: chunk.seq,
                chunk: chunk.text,
                reset: false,
                done: false,
                at: Utc::now(),
            },
        });
    }
}

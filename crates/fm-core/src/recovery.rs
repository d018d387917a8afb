use crate::error::EngineError;
use crate::store::{PromptStore, TranscriptStore, TransitionFields};
use crate::types::enums::{AttemptOutcome, ErrorKind, PromptStatus};
use crate::types::prompt::Prompt;
use tracing::{info, warn};

const INTERRUPTED_SUMMARY: &str = "prompt interrupted when the engine restarted; marked as failed";
const RESTART_COMPLETED_SUMMARY: &str = "completed after planned server restart";

/// Runs once at startup, before the scheduler begins consuming: prompts left
/// `running` by a crash become `failed`; prompts parked as
/// `server_restarting` auto-complete unless they require follow-up. Returns
/// the prompts whose state changed so the caller can publish update events.
pub fn reconcile_on_boot<S: PromptStore>(
    store: &S,
    transcripts: &dyn TranscriptStore,
) -> Result<Vec<Prompt>, EngineError> {
    let mut recovered = Vec::new();
    for prompt in store.list()? {
        match prompt.status {
            PromptStatus::Running => {
                if let Some(open) = prompt
                    .attempts
                    .last()
                    .filter(|attempt| attempt.is_open())
                {
                    let mut attempt = open.clone();
                    attempt.close(
                        AttemptOutcome::Interrupted,
                        Some(ErrorKind::Interrupted),
                        None,
                        INTERRUPTED_SUMMARY,
                    );
                    store.update_attempt(&prompt.id, attempt)?;
                }
                let updated = store.transition(
                    &prompt.id,
                    PromptStatus::Failed,
                    TransitionFields {
                        result_summary: Some(INTERRUPTED_SUMMARY.to_string()),
                        requires_follow_up: None,
                    },
                )?;
                if let Err(err) = transcripts.append_note(&prompt.id, INTERRUPTED_SUMMARY) {
                    warn!(prompt = %prompt.id, %err, "unable to note interruption in transcript");
                }
                warn!(prompt = %prompt.id, "recovered interrupted prompt; marked as failed");
                recovered.push(updated);
            }
            PromptStatus::ServerRestarting if !prompt.requires_follow_up => {
                let updated = store.transition(
                    &prompt.id,
                    PromptStatus::Completed,
                    TransitionFields {
                        result_summary: Some(RESTART_COMPLETED_SUMMARY.to_string()),
                        requires_follow_up: None,
                    },
                )?;
                info!(prompt = %prompt.id, "auto-completed prompt after planned restart");
                recovered.push(updated);
            }
            PromptStatus::ServerRestarting => {
                info!(
                    prompt = %prompt.id,
                    "leaving restart-marked prompt for operator follow-up"
                );
            }
            _ => {}
        }
    }
    Ok(recovered)
}

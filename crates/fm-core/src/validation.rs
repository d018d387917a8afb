use crate::error::StoreError;
use crate::types::enums::PromptStatus;

/// The prompt lifecycle state machine. `completed` is always terminal;
/// `failed` and `canceled` can only be requeued; `server_restarting` either
/// resumes or auto-completes during recovery.
pub fn validate_status_transition(
    from: PromptStatus,
    to: PromptStatus,
) -> Result<(), StoreError> {
    use PromptStatus::{Canceled, Completed, Failed, Queued, Running, ServerRestarting};

    if from == to {
        return Ok(());
    }

    let valid = match (from, to) {
        (Queued, Running) => true,
        (Running, Completed | Failed | Canceled | ServerRestarting) => true,
        (Failed | Canceled, Queued) => true,
        (ServerRestarting, Completed | Running) => true,
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

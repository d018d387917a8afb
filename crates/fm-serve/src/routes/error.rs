use axum::http::StatusCode;
use axum::Json;
use fm_core::{EngineError, RunnerError, ScopeError, StoreError, WorkspaceError};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub code: &'static str,
    pub message: String,
    pub correlation_id: Option<String>,
}

pub fn map_error(
    err: &EngineError,
    correlation_id: Option<String>,
) -> (StatusCode, Json<ErrorEnvelope>) {
    let (status, code, message) = match err {
        EngineError::Store(store) => map_store_error(store),
        EngineError::Workspace(workspace) => map_workspace_error(workspace),
        EngineError::Scope(scope) => map_scope_error(scope),
        EngineError::Runner(runner) => map_runner_error(runner),
        EngineError::Internal { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            message.clone(),
        ),
    };

    (
        status,
        Json(ErrorEnvelope {
            code,
            message,
            correlation_id,
        }),
    )
}

fn map_store_error(err: &StoreError) -> (StatusCode, &'static str, String) {
    match err {
        StoreError::NotFound => (StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StoreError::InvalidState { .. } | StoreError::InvalidTransition { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "invalid_state",
            err.to_string(),
        ),
        StoreError::InvalidInput { .. } => {
            (StatusCode::BAD_REQUEST, "invalid_input", err.to_string())
        }
        StoreError::Io { .. } | StoreError::Corrupt { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

fn map_workspace_error(err: &WorkspaceError) -> (StatusCode, &'static str, String) {
    match err {
        WorkspaceError::Dirty
        | WorkspaceError::FastForwardFailed { .. }
        | WorkspaceError::BaseBranchMissing { .. } => (
            StatusCode::PRECONDITION_FAILED,
            "precondition_failed",
            err.to_string(),
        ),
        WorkspaceError::NotAWorkTree | WorkspaceError::Backend { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

fn map_scope_error(err: &ScopeError) -> (StatusCode, &'static str, String) {
    match err {
        ScopeError::InvalidPattern { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

fn map_runner_error(err: &RunnerError) -> (StatusCode, &'static str, String) {
    match err {
        RunnerError::Spawn { .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "agent_unavailable",
            err.to_string(),
        ),
        RunnerError::Io { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        ),
    }
}

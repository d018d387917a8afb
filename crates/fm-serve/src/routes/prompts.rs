use crate::middleware::correlation::CorrelationId;
use crate::routes::error::map_error;
use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use fm_core::types::ids::{ProjectId, PromptId};
use fm_core::types::prompt::Prompt;
use fm_core::{EngineError, StoreError};
use fm_store::{parse_transcript, AttemptLog};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct EnqueueInput {
    #[serde(alias = "text")]
    prompt: String,
    #[serde(default, alias = "project")]
    project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditInput {
    #[serde(alias = "text")]
    prompt: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelInput {
    #[serde(default)]
    restart: bool,
}

#[derive(Debug, Deserialize)]
pub struct RestartingInput {
    summary: String,
    #[serde(default)]
    requires_follow_up: bool,
}

/// Full single-prompt payload: the record plus its parsed transcript.
#[derive(Debug, Serialize)]
pub struct PromptPayload {
    #[serde(flatten)]
    pub prompt: Prompt,
    pub log: String,
    pub attempt_logs: Vec<AttemptLog>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/prompts", post(enqueue).get(list))
        .route(
            "/prompts/{id}",
            get(get_prompt).put(edit).delete(delete_prompt),
        )
        .route("/prompts/{id}/retry", post(retry))
        .route("/prompts/{id}/cancel", post(cancel))
        .route("/prompts/{id}/restarting", post(mark_restarting))
        .with_state(state)
}

async fn enqueue(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(input): Json<EnqueueInput>,
) -> Response {
    let project_id = input
        .project_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(ProjectId::from);
    match state.engine.enqueue(&input.prompt, project_id) {
        Ok(prompt) => (StatusCode::CREATED, Json(prompt)).into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

async fn list(State(state): State<AppState>) -> Response {
    match state.engine.snapshot() {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(err) => map_error(&err, None).into_response(),
    }
}

async fn get_prompt(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.get(&id) {
        Ok(Some(prompt)) => {
            let log = state.engine.transcripts().read(&id).unwrap_or_default();
            let attempt_logs = parse_transcript(&log);
            Json(PromptPayload {
                prompt,
                log,
                attempt_logs,
            })
            .into_response()
        }
        Ok(None) => map_error(&EngineError::Store(StoreError::NotFound), None).into_response(),
        Err(err) => map_error(&err, None).into_response(),
    }
}

async fn edit(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    Json(input): Json<EditInput>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.edit_text(&id, &input.prompt) {
        Ok(prompt) => Json(prompt).into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

async fn delete_prompt(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.delete(&id) {
        Ok(_) => Json(serde_json::json!({ "prompt_id": id, "deleted": true })).into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

async fn retry(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.retry(&id) {
        Ok(prompt) => (StatusCode::ACCEPTED, Json(prompt)).into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

async fn cancel(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    Json(input): Json<CancelInput>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.engine.cancel(&id, input.restart) {
        Ok(_) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({
                "prompt_id": id,
                "status": "canceling",
                "restart": input.restart,
            })),
        )
            .into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

async fn mark_restarting(
    State(state): State<AppState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(id): Path<String>,
    Json(input): Json<RestartingInput>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state
        .engine
        .mark_server_restarting(&id, &input.summary, input.requires_follow_up)
    {
        Ok(prompt) => Json(prompt).into_response(),
        Err(err) => map_error(&err, Some(correlation.0)).into_response(),
    }
}

fn parse_id(raw: &str) -> Result<PromptId, Response> {
    PromptId::new(raw.to_string()).map_err(|err| {
        map_error(
            &EngineError::Store(StoreError::InvalidInput {
                message: err.to_string(),
            }),
            None,
        )
        .into_response()
    })
}

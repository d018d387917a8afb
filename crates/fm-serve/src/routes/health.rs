use crate::routes::error::map_error;
use crate::AppState;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    match state.engine.health() {
        Ok(health) => Json(health).into_response(),
        Err(err) => map_error(&err, None).into_response(),
    }
}

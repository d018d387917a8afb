pub mod error;
pub mod health;
pub mod prompts;

use crate::middleware::correlation::correlation_middleware;
use crate::AppState;
use axum::middleware;
use axum::Router;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(prompts::router(state.clone()))
        .merge(health::router(state))
        .route_layer(middleware::from_fn(correlation_middleware))
}

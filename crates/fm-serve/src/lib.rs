pub mod middleware;
pub mod routes;
pub mod ws;

use axum::Router;
use fm_core::Engine;
use fm_store::JsonStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine<JsonStore>>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", routes::router(state.clone()))
        .merge(ws::router(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "engine api listening");
    axum::serve(listener, app(state)).await
}

//! HTTP gateway for Canopy.
//!
//! A thin axum layer over the chat orchestrator: JSON request/response
//! endpoints for tree management and turn handling, plus an SSE adapter from
//! the orchestrator's event channel to the wire.

pub mod api;

use canopy_chat::ChatOrchestrator;
use std::sync::Arc;
use tracing::info;

/// Shared state for all handlers.
pub struct AppState {
    pub orchestrator: Arc<ChatOrchestrator>,
}

pub type SharedState = Arc<AppState>;

/// Build the full application router.
pub fn router(state: SharedState) -> axum::Router {
    api::api_router(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: SharedState, host: &str, port: u16) -> std::io::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Gateway listening");
    axum::serve(listener, router(state)).await
}

//! HTTP Gateway
//!
//! Webhook receiver feeding the ingestion queue plus the read-only query
//! endpoints. Responses use the `{code, msg, data}` envelope.

pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::escrow::worker::ShutdownSignal;
use state::AppState;

/// Build the router over shared state
pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/webhooks/events", post(handlers::receive_event))
        .route("/events/parked", get(handlers::list_parked_events))
        .route("/users/{user_id}/balance", get(handlers::get_balance))
        .route("/users/{user_id}/payouts", get(handlers::get_payouts))
        .route("/users/{user_id}/activity", get(handlers::get_activity))
        .route("/bounties/{bounty_id}/fund", get(handlers::get_fund));

    Router::new().nest("/api/v1", api).with_state(state)
}

/// Serve until `shutdown` fires
pub async fn run_server(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: Arc<ShutdownSignal>,
) -> std::io::Result<()> {
    let app = build_router(state);
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Gateway listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

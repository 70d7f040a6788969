//! Health check handler

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode};
use chrono::Utc;
use tracing::error;

use super::super::state::AppState;
use super::super::types::{ApiResponse, HealthData, error_codes};

/// GET /api/v1/health
///
/// - Healthy: 200 + {code: 0, data: {timestamp_ms, version}}
/// - Store unreachable: 503, no internal details exposed
pub async fn health_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<HealthData>>) {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(HealthData {
                timestamp_ms: Utc::now().timestamp_millis(),
                version: env!("GIT_HASH"),
            })),
        ),
        Err(e) => {
            error!(error = %e, "Health check: ledger store unreachable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::error(
                    error_codes::SERVICE_UNAVAILABLE,
                    "unavailable",
                )),
            )
        }
    }
}

//! Inbound event webhook and the parked-event listing

use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use tracing::{debug, error, warn};

use super::super::state::AppState;
use super::super::types::{AcceptedData, ApiResponse, ParkedEventData, error_codes};
use super::helpers::{ApiResult, HistoryParams, api_error, ok, store_error};
use crate::escrow::state::InboxStatus;
use crate::escrow::types::PaymentEvent;
use crate::escrow::worker::{AcceptError, QueueError, accept_event};

/// POST /api/v1/webhooks/events
///
/// Writes the event to the inbox, queues it for the ingestion workers and
/// answers 202. An inbox failure answers 503 and a full queue 429, so the
/// sender redelivers later.
pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    Json(event): Json<PaymentEvent>,
) -> ApiResult<AcceptedData> {
    if event.id.trim().is_empty() || event.bounty_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_PARAMETER,
            "id and bounty_id are required",
        ));
    }

    let event_id = event.id.clone();
    debug!(event_id = %event_id, bounty_id = %event.bounty_id, event_type = %event.kind, "Webhook received");

    match accept_event(state.store.as_ref(), &state.queue, event).await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(AcceptedData { event_id })),
        )),
        Err(AcceptError::Store(e)) => {
            error!(event_id = %event_id, code = e.code(), error = %e, "Inbox write failed");
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                error_codes::SERVICE_UNAVAILABLE,
                "storage unavailable, retry later",
            ))
        }
        Err(AcceptError::Queue(QueueError::Full)) => {
            warn!(event_id = %event_id, "Event queue full, asking sender to retry");
            Err(api_error(
                StatusCode::TOO_MANY_REQUESTS,
                error_codes::QUEUE_FULL,
                "queue full, retry later",
            ))
        }
        Err(AcceptError::Queue(QueueError::Closed)) => Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            "shutting down",
        )),
    }
}

/// GET /api/v1/events/parked
///
/// Accepted events the workers could not apply, oldest first
pub async fn list_parked_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<ParkedEventData>> {
    let parked = state
        .store
        .inbox_entries(InboxStatus::Parked, params.limit())
        .await
        .map_err(store_error)?;
    ok(parked.iter().map(ParkedEventData::from).collect())
}

//! Handler helpers shared by the endpoints

use axum::{Json, http::StatusCode};
use serde::Deserialize;
use tracing::error;

use super::super::types::{ApiResponse, error_codes};
use crate::escrow::error::StoreError;
use crate::escrow::query::DEFAULT_HISTORY_LIMIT;

/// Upper bound on `?limit=`
pub const MAX_HISTORY_LIMIT: usize = 500;

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);
pub type ApiResult<T> = Result<(StatusCode, Json<ApiResponse<T>>), ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok((StatusCode::OK, Json(ApiResponse::success(data))))
}

pub fn api_error(status: StatusCode, code: i32, msg: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::error(code, msg)))
}

/// Storage failures are logged in full; clients only see a generic error
pub fn store_error(e: StoreError) -> ApiError {
    error!(code = e.code(), error = %e, "Query failed");
    api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        error_codes::INTERNAL_ERROR,
        "internal error",
    )
}

/// `?limit=` for history listings
#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
}

impl HistoryParams {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

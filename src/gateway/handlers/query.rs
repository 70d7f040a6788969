//! Read-only user and bounty endpoints

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
};

use super::super::state::AppState;
use super::super::types::{ActivityData, BalanceData, FundData, PayoutData, error_codes};
use super::helpers::{ApiResult, HistoryParams, api_error, ok, store_error};

/// GET /api/v1/users/{user_id}/balance
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Vec<BalanceData>> {
    let balances = state.queries.balance(&user_id).await.map_err(store_error)?;
    ok(balances.iter().map(BalanceData::from).collect())
}

/// GET /api/v1/users/{user_id}/payouts
pub async fn get_payouts(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<PayoutData>> {
    let payouts = state
        .queries
        .payout_history(&user_id, params.limit())
        .await
        .map_err(store_error)?;
    ok(payouts.iter().map(PayoutData::from).collect())
}

/// GET /api/v1/users/{user_id}/activity
pub async fn get_activity(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Vec<ActivityData>> {
    let entries = state
        .queries
        .activity(&user_id, params.limit())
        .await
        .map_err(store_error)?;
    ok(entries.iter().map(ActivityData::from).collect())
}

/// GET /api/v1/bounties/{bounty_id}/fund
pub async fn get_fund(
    State(state): State<Arc<AppState>>,
    Path(bounty_id): Path<String>,
) -> ApiResult<FundData> {
    match state.queries.fund_view(&bounty_id).await.map_err(store_error)? {
        Some(view) => ok(FundData::from(&view)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            error_codes::NOT_FOUND,
            "fund not found",
        )),
    }
}

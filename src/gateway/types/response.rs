//! API response wrapper, error codes and response DTOs

use serde::Serialize;

use crate::escrow::query::{Balance, FundView, VisibleStatus};
use crate::escrow::types::{InboundEvent, PayoutRecord, TransactionRecord};
use crate::money::format_amount;

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: payload on success, absent on error
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

// ============================================================================
// Response DTOs
// ============================================================================

/// Webhook acknowledgement
#[derive(Debug, Serialize)]
pub struct AcceptedData {
    pub event_id: String,
}

/// Amounts are decimal strings in major units
#[derive(Debug, Serialize)]
pub struct BalanceData {
    pub currency: String,
    pub released: String,
    pub disbursed: String,
    pub processing: String,
    pub available: String,
}

impl From<&Balance> for BalanceData {
    fn from(b: &Balance) -> Self {
        Self {
            currency: b.currency.clone(),
            released: format_amount(b.released, &b.currency),
            disbursed: format_amount(b.disbursed, &b.currency),
            processing: format_amount(b.processing, &b.currency),
            available: format_amount(b.available, &b.currency),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PayoutData {
    pub payout_id: String,
    pub bounty_id: String,
    pub kind: String,
    pub amount: String,
    pub currency: String,
    pub attempt: u32,
    pub status: String,
    pub created_at: i64,
}

impl From<&PayoutRecord> for PayoutData {
    fn from(p: &PayoutRecord) -> Self {
        Self {
            payout_id: p.id.to_string(),
            bounty_id: p.bounty_id.clone(),
            kind: p.kind.as_str().to_string(),
            amount: format_amount(p.amount, &p.currency),
            currency: p.currency.clone(),
            attempt: p.attempt,
            status: p.status.as_str().to_string(),
            created_at: p.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ActivityData {
    pub id: String,
    pub bounty_id: String,
    #[serde(rename = "type")]
    pub tx_type: String,
    pub amount: String,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    pub created_at: i64,
}

impl From<&TransactionRecord> for ActivityData {
    fn from(t: &TransactionRecord) -> Self {
        Self {
            id: t.id.to_string(),
            bounty_id: t.bounty_id.clone(),
            tx_type: t.tx_type.as_str().to_string(),
            amount: format_amount(t.amount, &t.currency),
            currency: t.currency.clone(),
            reference: t.processor_reference.clone(),
            created_at: t.created_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FundData {
    pub bounty_id: String,
    pub status: VisibleStatus,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_amount: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<String>,
}

impl From<&FundView> for FundData {
    fn from(v: &FundView) -> Self {
        Self {
            bounty_id: v.bounty_id.clone(),
            status: v.status,
            currency: v.currency.clone(),
            net_amount: v.net_amount.map(|a| format_amount(a, &v.currency)),
            refund_amount: v.refund_amount.map(|a| format_amount(a, &v.currency)),
        }
    }
}

/// Inbox entry waiting for the relay or an operator
#[derive(Debug, Serialize)]
pub struct ParkedEventData {
    pub event_id: String,
    pub bounty_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub received_at: i64,
    pub updated_at: i64,
}

impl From<&InboundEvent> for ParkedEventData {
    fn from(e: &InboundEvent) -> Self {
        Self {
            event_id: e.event.id.clone(),
            bounty_id: e.event.bounty_id.clone(),
            event_type: e.event.kind.as_str().to_string(),
            attempts: e.attempts,
            last_error: e.last_error.clone(),
            received_at: e.received_at.timestamp_millis(),
            updated_at: e.updated_at.timestamp_millis(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthData {
    pub timestamp_ms: i64,
    pub version: &'static str,
}

// ============================================================================
// Error Codes
// ============================================================================

/// Standard API error codes
pub mod error_codes {
    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;

    // Resource errors (4xxx)
    pub const NOT_FOUND: i32 = 4001;
    pub const QUEUE_FULL: i32 = 4291;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;
}

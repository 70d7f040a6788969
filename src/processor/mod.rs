//! Payment Processor seam
//!
//! Commands (`create_transfer`, `create_refund`) are issued by the payout
//! dispatcher; queries are used by reconciliation. Every command carries an
//! idempotency key (the payout attempt id) so a retried call never moves money
//! twice.

pub mod http;
#[cfg(feature = "mock-api")]
pub mod sandbox;

pub use http::HttpProcessor;
#[cfg(feature = "mock-api")]
pub use sandbox::SandboxProcessor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Amount;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    /// Network failure, timeout, 5xx or rate limit
    #[error("Transient processor error: {0}")]
    Transient(String),

    /// The processor refused the request (4xx); retrying will not help
    #[error("Processor rejected request: {0}")]
    Rejected(String),

    #[error("Not found at processor: {0}")]
    NotFound(String),

    #[error("Malformed processor response: {0}")]
    Decode(String),
}

impl ProcessorError {
    pub fn code(&self) -> &'static str {
        match self {
            ProcessorError::Transient(_) => "PROCESSOR_TRANSIENT",
            ProcessorError::Rejected(_) => "PROCESSOR_REJECTED",
            ProcessorError::NotFound(_) => "PROCESSOR_NOT_FOUND",
            ProcessorError::Decode(_) => "PROCESSOR_DECODE",
        }
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessorError::Transient(_))
    }
}

/// Transfer of a net payout to a connected account
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferCommand {
    /// Sent as metadata so acknowledgements can be routed back to the fund
    pub bounty_id: String,
    pub transfer_group: String,
    pub recipient_id: String,
    pub amount: Amount,
    pub currency: String,
    pub idempotency_key: String,
}

/// Refund against a captured payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundCommand {
    pub bounty_id: String,
    pub payment_reference: String,
    pub amount: Amount,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub idempotency_key: String,
}

/// Settlement status of a processor object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorPayment {
    pub reference: String,
    pub amount_captured: Amount,
    pub currency: String,
    pub status: RemoteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorTransfer {
    pub reference: String,
    pub transfer_group: String,
    pub destination: String,
    pub amount: Amount,
    pub currency: String,
    pub status: RemoteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorRefund {
    pub reference: String,
    pub payment_reference: String,
    pub amount: Amount,
    pub currency: String,
    pub status: RemoteStatus,
}

/// External payment processor
///
/// Commands return the processor reference on synchronous acceptance; the
/// final outcome arrives later on the event feed.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Processor name for logging
    fn name(&self) -> &'static str;

    async fn create_transfer(&self, cmd: &TransferCommand) -> Result<String, ProcessorError>;

    async fn create_refund(&self, cmd: &RefundCommand) -> Result<String, ProcessorError>;

    async fn retrieve_payment(
        &self,
        payment_reference: &str,
    ) -> Result<ProcessorPayment, ProcessorError>;

    async fn list_transfers(
        &self,
        transfer_group: &str,
    ) -> Result<Vec<ProcessorTransfer>, ProcessorError>;

    async fn list_refunds(
        &self,
        payment_reference: &str,
    ) -> Result<Vec<ProcessorRefund>, ProcessorError>;
}

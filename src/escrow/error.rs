//! Escrow Error Types
//!
//! Validator rejections, storage failures, dispatch failures and the
//! ingestion-level wrapper. Each carries a stable `code()` for logs and APIs.

use thiserror::Error;

use super::state::{FundStatus, PayoutKind};
use crate::fee::FeeError;
use crate::money::Amount;
use crate::processor::ProcessorError;

/// Why the transition validator refused an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransitionError {
    // === Expected, non-fatal ===
    #[error("Fund record is already {status} (terminal)")]
    TerminalState { status: FundStatus },

    #[error("Already applied: {0}")]
    AlreadyApplied(&'static str),

    // === Re-deliverable: precondition not met yet ===
    #[error("Premature event: {0}")]
    Premature(String),

    // === Fatal for the event, needs review ===
    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: Amount, actual: Amount },

    #[error("Currency mismatch: expected {expected}, got {actual}")]
    CurrencyMismatch { expected: String, actual: String },

    #[error("Payment reference mismatch: expected {expected}, got {actual}")]
    ReferenceMismatch { expected: String, actual: String },

    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Missing event field: {0}")]
    MissingField(&'static str),

    #[error("A {0} is already in flight")]
    ActionInProgress(PayoutKind),

    #[error("Retries exhausted after {attempts} failed attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Fee schedule not supplied for capture")]
    FeeScheduleUnavailable,

    #[error("Invalid state transition: {0}")]
    InvalidTransition(String),
}

impl TransitionError {
    pub fn code(&self) -> &'static str {
        match self {
            TransitionError::TerminalState { .. } => "TERMINAL_STATE",
            TransitionError::AlreadyApplied(_) => "ALREADY_APPLIED",
            TransitionError::Premature(_) => "PREMATURE_EVENT",
            TransitionError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            TransitionError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            TransitionError::ReferenceMismatch { .. } => "REFERENCE_MISMATCH",
            TransitionError::ZeroAmount => "ZERO_AMOUNT",
            TransitionError::MissingField(_) => "MISSING_FIELD",
            TransitionError::ActionInProgress(_) => "ACTION_IN_PROGRESS",
            TransitionError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            TransitionError::FeeScheduleUnavailable => "FEE_SCHEDULE_UNAVAILABLE",
            TransitionError::InvalidTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }

    /// Late or duplicate delivery against a record that already moved on.
    /// Acknowledged silently.
    #[inline]
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            TransitionError::TerminalState { .. } | TransitionError::AlreadyApplied(_)
        )
    }

    /// The event arrived ahead of its precondition; it must stay unprocessed
    /// so a later delivery can apply it.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransitionError::Premature(_))
    }

    /// Money figures disagree; never auto-corrected
    #[inline]
    pub fn needs_review(&self) -> bool {
        matches!(
            self,
            TransitionError::AmountMismatch { .. }
                | TransitionError::CurrencyMismatch { .. }
                | TransitionError::ReferenceMismatch { .. }
        )
    }
}

/// Ledger storage errors
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    /// Optimistic version check failed: someone else committed first
    #[error("Version conflict on fund {0}")]
    VersionConflict(String),

    /// The event id is claimed by a transaction that has not finished yet
    #[error("Contention: {0}")]
    Contention(String),

    #[error("Amount out of range for storage: {0}")]
    AmountOverflow(u64),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Database(_) => "DATABASE_ERROR",
            StoreError::VersionConflict(_) => "VERSION_CONFLICT",
            StoreError::Contention(_) => "CONTENTION",
            StoreError::AmountOverflow(_) => "AMOUNT_OVERFLOW",
            StoreError::Corrupt(_) => "CORRUPT_ROW",
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Payout dispatcher errors
#[derive(Error, Debug, Clone)]
pub enum DispatchError {
    #[error("Fund record not found: {0}")]
    FundNotFound(String),

    #[error("Nothing to dispatch: {0}")]
    NothingToDispatch(String),

    /// Processor refused the command for good (4xx); no automatic retry
    #[error("Processor rejected {kind}: {reason}")]
    Rejected { kind: PayoutKind, reason: String },

    #[error("Transient dispatch error: {0}")]
    Transient(String),

    #[error("Permanent dispatch failure: {kind} gave up after {attempts} attempts")]
    PermanentFailure { kind: PayoutKind, attempts: u32 },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl DispatchError {
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::FundNotFound(_) => "FUND_NOT_FOUND",
            DispatchError::NothingToDispatch(_) => "NOTHING_TO_DISPATCH",
            DispatchError::Rejected { .. } => "PROCESSOR_REJECTED",
            DispatchError::Transient(_) => "TRANSIENT_DISPATCH_ERROR",
            DispatchError::PermanentFailure { .. } => "PERMANENT_DISPATCH_FAILURE",
            DispatchError::Store(e) => e.code(),
        }
    }
}

impl From<ProcessorError> for DispatchError {
    fn from(e: ProcessorError) -> Self {
        DispatchError::Transient(e.to_string())
    }
}

/// Errors that abort an ingestion attempt; the event stays unprocessed
#[derive(Error, Debug, Clone)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Fee schedule error: {0}")]
    Fee(#[from] FeeError),

    #[error("Invalid request: {0}")]
    Invalid(#[from] TransitionError),
}

impl IngestError {
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Store(e) => e.code(),
            IngestError::Fee(e) => e.code(),
            IngestError::Invalid(e) => e.code(),
        }
    }

    /// Worth another delivery: storage hiccup or fee lookup outage.
    /// A bad tier table will not fix itself.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IngestError::Store(_) | IngestError::Fee(FeeError::Unavailable(_))
        )
    }
}

/// Reconciliation run errors
#[derive(Error, Debug, Clone)]
pub enum ReconcileError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
}

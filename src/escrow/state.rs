//! Ledger state definitions
//!
//! State IDs are stored in PostgreSQL as SMALLINT.
//! Negative IDs mark money leaving escrow back to the payer or a failed attempt.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Fund record status
///
/// Terminal states: RELEASED (20), REFUNDED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum FundStatus {
    /// Record exists, capture not yet confirmed by the processor
    Pending = 0,

    /// Funds captured and held in escrow
    Held = 10,

    /// Terminal: net amount transferred to the recipient
    Released = 20,

    /// Terminal: funds returned to the payer
    Refunded = -10,
}

impl FundStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, FundStatus::Released | FundStatus::Refunded)
    }

    /// Get the numeric state ID for PostgreSQL storage
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    /// Convert from PostgreSQL state ID
    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(FundStatus::Pending),
            10 => Some(FundStatus::Held),
            20 => Some(FundStatus::Released),
            -10 => Some(FundStatus::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FundStatus::Pending => "pending",
            FundStatus::Held => "held",
            FundStatus::Released => "released",
            FundStatus::Refunded => "refunded",
        }
    }
}

impl fmt::Display for FundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<i16> for FundStatus {
    type Error = ();

    fn try_from(value: i16) -> Result<Self, Self::Error> {
        FundStatus::from_id(value).ok_or(())
    }
}

/// Payout attempt status
///
/// Final states: COMPLETED (20), FAILED (-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum PayoutStatus {
    /// Recorded, processor not called yet (persist-before-call)
    Pending = 0,

    /// Processor accepted the command, acknowledgement outstanding
    Processing = 10,

    Completed = 20,

    Failed = -10,
}

impl PayoutStatus {
    #[inline]
    pub fn is_final(&self) -> bool {
        matches!(self, PayoutStatus::Completed | PayoutStatus::Failed)
    }

    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(PayoutStatus::Pending),
            10 => Some(PayoutStatus::Processing),
            20 => Some(PayoutStatus::Completed),
            -10 => Some(PayoutStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Processing => "processing",
            PayoutStatus::Completed => "completed",
            PayoutStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of an outbound money movement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum PayoutKind {
    /// Net amount to the bounty recipient
    Transfer = 1,
    /// Money back to the payer
    Refund = 2,
}

impl PayoutKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(PayoutKind::Transfer),
            2 => Some(PayoutKind::Refund),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutKind::Transfer => "transfer",
            PayoutKind::Refund => "refund",
        }
    }
}

impl fmt::Display for PayoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum TransactionType {
    PaymentIntent = 1,
    Transfer = 2,
    Refund = 3,
    Payout = 4,
}

impl TransactionType {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(TransactionType::PaymentIntent),
            2 => Some(TransactionType::Transfer),
            3 => Some(TransactionType::Refund),
            4 => Some(TransactionType::Payout),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::PaymentIntent => "payment_intent",
            TransactionType::Transfer => "transfer",
            TransactionType::Refund => "refund",
            TransactionType::Payout => "payout",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a reconciliation discrepancy compares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i16)]
pub enum DiscrepancyKind {
    CapturedAmount = 1,
    TransferStatus = 2,
    RefundStatus = 3,
    PayoutExhausted = 4,
    MissingAtProcessor = 5,
    /// Movement in flight with no open attempt and nothing left to re-drive
    DispatchStalled = 6,
}

impl DiscrepancyKind {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(DiscrepancyKind::CapturedAmount),
            2 => Some(DiscrepancyKind::TransferStatus),
            3 => Some(DiscrepancyKind::RefundStatus),
            4 => Some(DiscrepancyKind::PayoutExhausted),
            5 => Some(DiscrepancyKind::MissingAtProcessor),
            6 => Some(DiscrepancyKind::DispatchStalled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::CapturedAmount => "captured_amount",
            DiscrepancyKind::TransferStatus => "transfer_status",
            DiscrepancyKind::RefundStatus => "refund_status",
            DiscrepancyKind::PayoutExhausted => "payout_exhausted",
            DiscrepancyKind::MissingAtProcessor => "missing_at_processor",
            DiscrepancyKind::DispatchStalled => "dispatch_stalled",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Inbox entry state
///
/// `Queued` entries are accepted and on their way through the workers.
/// `Parked` entries could not be applied in the live path and wait for the
/// relay or an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum InboxStatus {
    Queued = 0,
    Parked = 1,
}

impl InboxStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(InboxStatus::Queued),
            1 => Some(InboxStatus::Parked),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Queued => "queued",
            InboxStatus::Parked => "parked",
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

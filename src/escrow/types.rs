//! Escrow core types
//!
//! Records persisted by the ledger plus the inbound payment event shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::TransitionError;
use super::state::{
    DiscrepancyKind, FundStatus, InboxStatus, PayoutKind, PayoutStatus, TransactionType,
};
use crate::money::{Amount, normalize_currency};

pub type BountyId = String;
pub type UserId = String;

/// ULID-backed record identifiers: sortable, no coordination needed.
macro_rules! ulid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(ulid::Ulid);

        impl $name {
            pub fn new() -> Self {
                Self(ulid::Ulid::new())
            }

            pub fn inner(&self) -> ulid::Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ulid::DecodeError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(ulid::Ulid::from_string(s)?))
            }
        }
    };
}

ulid_id!(
    /// Fund record identifier
    FundRecordId
);
ulid_id!(
    /// Payout attempt identifier
    PayoutId
);
ulid_id!(
    /// Audit entry identifier
    TransactionId
);
ulid_id!(DiscrepancyId);

/// Outbound movement in flight while a fund is `held`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PendingAction {
    /// Net amount is being transferred to `FundRecord::recipient_id`
    Transfer,
    /// Refund of `amount` to the payer is in progress
    Refund {
        amount: Amount,
        reason: Option<String>,
    },
}

impl PendingAction {
    pub fn kind(&self) -> PayoutKind {
        match self {
            PendingAction::Transfer => PayoutKind::Transfer,
            PendingAction::Refund { .. } => PayoutKind::Refund,
        }
    }
}

/// One escrow record per funded bounty
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundRecord {
    pub id: FundRecordId,
    pub bounty_id: BountyId,
    pub payer_id: UserId,
    /// Processor capture id; immutable once set
    pub payment_reference: Option<String>,
    pub transfer_group: String,
    pub amount: Amount,
    pub currency: String,
    pub platform_fee_amount: Amount,
    pub net_amount: Amount,
    pub status: FundStatus,
    /// Only set once `status == Refunded`
    pub refund_amount: Option<Amount>,
    pub refund_reason: Option<String>,
    pub recipient_id: Option<UserId>,
    pub pending_action: Option<PendingAction>,
    /// Asynchronous failures of the in-flight action
    pub failed_attempts: u32,
    /// Retry budget exhausted; needs an operator
    pub flagged: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FundRecord {
    /// New record awaiting capture confirmation.
    ///
    /// The fee is not known yet, so the net provisionally equals the gross
    /// amount and the split invariant holds from the first observation.
    pub fn new_pending(
        bounty_id: impl Into<BountyId>,
        payer_id: impl Into<UserId>,
        amount: Amount,
        currency: &str,
        payment_reference: Option<String>,
        transfer_group: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let bounty_id = bounty_id.into();
        let transfer_group = transfer_group.unwrap_or_else(|| default_transfer_group(&bounty_id));
        Self {
            id: FundRecordId::new(),
            bounty_id,
            payer_id: payer_id.into(),
            payment_reference,
            transfer_group,
            amount,
            currency: normalize_currency(currency),
            platform_fee_amount: 0,
            net_amount: amount,
            status: FundStatus::Pending,
            refund_amount: None,
            refund_reason: None,
            recipient_id: None,
            pending_action: None,
            failed_attempts: 0,
            flagged: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Seed record for a capture event on a bounty the ledger has not seen
    pub fn from_capture(event: &PaymentEvent, now: DateTime<Utc>) -> Option<Self> {
        let payer_id = event.payload.payer_id.clone()?;
        Some(Self::new_pending(
            event.bounty_id.clone(),
            payer_id,
            event.amount,
            &event.currency,
            event.payload.payment_reference.clone(),
            event.payload.transfer_group.clone(),
            now,
        ))
    }

    /// Kind of the outbound movement currently in flight
    pub fn in_flight(&self) -> Option<PayoutKind> {
        self.pending_action.as_ref().map(PendingAction::kind)
    }
}

pub fn default_transfer_group(bounty_id: &str) -> String {
    format!("bounty_{}", bounty_id)
}

/// Inbound event type on the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CaptureConfirmed,
    BountyCompleted,
    BountyCancelled,
    TransferSucceeded,
    TransferFailed,
    RefundSucceeded,
    RefundFailed,
    /// Released net amount paid out from the recipient's balance to their bank
    PayoutPaid,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CaptureConfirmed => "capture_confirmed",
            EventKind::BountyCompleted => "bounty_completed",
            EventKind::BountyCancelled => "bounty_cancelled",
            EventKind::TransferSucceeded => "transfer_succeeded",
            EventKind::TransferFailed => "transfer_failed",
            EventKind::RefundSucceeded => "refund_succeeded",
            EventKind::RefundFailed => "refund_failed",
            EventKind::PayoutPaid => "payout_paid",
        }
    }

    #[inline]
    pub fn is_capture(&self) -> bool {
        matches!(self, EventKind::CaptureConfirmed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Event-specific fields; unknown keys are kept in `extra`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payer_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    /// Processor reference of the transfer/refund being acknowledged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Record on the inbound event feed (at-least-once, possibly reordered)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: String,
    pub bounty_id: BountyId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub amount: Amount,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub payload: EventPayload,
}

impl PaymentEvent {
    pub fn new(
        id: impl Into<String>,
        bounty_id: impl Into<BountyId>,
        kind: EventKind,
        amount: Amount,
        currency: &str,
    ) -> Self {
        Self {
            id: id.into(),
            bounty_id: bounty_id.into(),
            kind,
            amount,
            currency: normalize_currency(currency),
            occurred_at: Utc::now(),
            payload: EventPayload::default(),
        }
    }

    pub fn payer(mut self, payer_id: &str) -> Self {
        self.payload.payer_id = Some(payer_id.to_string());
        self
    }

    pub fn recipient(mut self, recipient_id: &str) -> Self {
        self.payload.recipient_id = Some(recipient_id.to_string());
        self
    }

    pub fn payment_reference(mut self, reference: &str) -> Self {
        self.payload.payment_reference = Some(reference.to_string());
        self
    }

    pub fn reference(mut self, reference: &str) -> Self {
        self.payload.reference = Some(reference.to_string());
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.payload.reason = Some(reason.to_string());
        self
    }

    pub fn error(mut self, error: &str) -> Self {
        self.payload.error = Some(error.to_string());
        self
    }
}

/// Validator input, decoded from a [`PaymentEvent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundEvent {
    CaptureConfirmed {
        amount: Amount,
        currency: String,
        payment_reference: Option<String>,
    },
    BountyCompleted {
        recipient_id: UserId,
    },
    /// `amount == None` refunds the full captured amount
    BountyCancelled {
        amount: Option<Amount>,
        reason: Option<String>,
    },
    TransferSucceeded {
        amount: Amount,
        currency: String,
        reference: Option<String>,
    },
    TransferFailed {
        reference: Option<String>,
        error: Option<String>,
    },
    RefundSucceeded {
        amount: Amount,
        currency: String,
        reference: Option<String>,
    },
    RefundFailed {
        reference: Option<String>,
        error: Option<String>,
    },
}

impl FundEvent {
    pub fn from_payment_event(event: &PaymentEvent) -> Result<Self, TransitionError> {
        let currency = normalize_currency(&event.currency);
        let payload = &event.payload;
        Ok(match event.kind {
            EventKind::CaptureConfirmed => {
                if event.amount == 0 {
                    return Err(TransitionError::ZeroAmount);
                }
                FundEvent::CaptureConfirmed {
                    amount: event.amount,
                    currency,
                    payment_reference: payload.payment_reference.clone(),
                }
            }
            EventKind::BountyCompleted => FundEvent::BountyCompleted {
                recipient_id: payload
                    .recipient_id
                    .clone()
                    .ok_or(TransitionError::MissingField("recipient_id"))?,
            },
            EventKind::BountyCancelled => FundEvent::BountyCancelled {
                amount: (event.amount > 0).then_some(event.amount),
                reason: payload.reason.clone(),
            },
            EventKind::TransferSucceeded => FundEvent::TransferSucceeded {
                amount: event.amount,
                currency,
                reference: payload.reference.clone(),
            },
            EventKind::TransferFailed => FundEvent::TransferFailed {
                reference: payload.reference.clone(),
                error: payload.error.clone(),
            },
            EventKind::RefundSucceeded => FundEvent::RefundSucceeded {
                amount: event.amount,
                currency,
                reference: payload.reference.clone(),
            },
            EventKind::RefundFailed => FundEvent::RefundFailed {
                reference: payload.reference.clone(),
                error: payload.error.clone(),
            },
            EventKind::PayoutPaid => {
                return Err(TransitionError::InvalidTransition(
                    "payout_paid does not move a fund record".to_string(),
                ));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            FundEvent::CaptureConfirmed { .. } => "CaptureConfirmed",
            FundEvent::BountyCompleted { .. } => "BountyCompleted",
            FundEvent::BountyCancelled { .. } => "BountyCancelled",
            FundEvent::TransferSucceeded { .. } => "TransferSucceeded",
            FundEvent::TransferFailed { .. } => "TransferFailed",
            FundEvent::RefundSucceeded { .. } => "RefundSucceeded",
            FundEvent::RefundFailed { .. } => "RefundFailed",
        }
    }
}

/// One transfer or refund attempt, owned by the payout dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub id: PayoutId,
    pub fund_record_id: FundRecordId,
    pub bounty_id: BountyId,
    pub kind: PayoutKind,
    pub recipient_id: UserId,
    pub amount: Amount,
    pub currency: String,
    /// 1-based attempt number for this fund and kind
    pub attempt: u32,
    pub status: PayoutStatus,
    pub transfer_reference: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRecord {
    pub fn new(
        fund: &FundRecord,
        kind: PayoutKind,
        recipient_id: UserId,
        amount: Amount,
        attempt: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: PayoutId::new(),
            fund_record_id: fund.id,
            bounty_id: fund.bounty_id.clone(),
            kind,
            recipient_id,
            amount,
            currency: fund.currency.clone(),
            attempt,
            status: PayoutStatus::Pending,
            transfer_reference: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable audit entry for a money-relevant event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: TransactionId,
    pub bounty_id: BountyId,
    pub fund_record_id: FundRecordId,
    /// Party the entry concerns: payer for captures/refunds, recipient for transfers
    pub user_id: UserId,
    pub tx_type: TransactionType,
    pub amount: Amount,
    pub currency: String,
    pub processor_reference: Option<String>,
    pub event_id: String,
    pub created_at: DateTime<Utc>,
}

/// Drift between local ledger state and the processor, for manual resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationDiscrepancy {
    pub id: DiscrepancyId,
    pub fund_record_id: FundRecordId,
    pub bounty_id: BountyId,
    pub kind: DiscrepancyKind,
    pub local_view: serde_json::Value,
    pub processor_view: serde_json::Value,
    pub detected_at: DateTime<Utc>,
}

/// Accepted webhook event kept until the ledger has a final answer for it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub event: PaymentEvent,
    pub status: InboxStatus,
    /// Relay passes that did not settle the event
    pub attempts: u32,
    pub last_error: Option<String>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn queued(event: PaymentEvent, now: DateTime<Utc>) -> Self {
        Self {
            event,
            status: InboxStatus::Queued,
            attempts: 0,
            last_error: None,
            received_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserializes_from_feed_shape() {
        let json = r#"{
            "id": "evt_1",
            "bounty_id": "b-42",
            "type": "capture_confirmed",
            "amount": 10000,
            "currency": "USD",
            "occurred_at": "2026-01-01T00:00:00Z",
            "payload": {"payer_id": "alice", "payment_reference": "pi_1", "livemode": false}
        }"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.kind, EventKind::CaptureConfirmed);
        assert_eq!(event.bounty_id, "b-42");
        assert_eq!(event.payload.payer_id.as_deref(), Some("alice"));
        assert_eq!(
            event.payload.extra.get("livemode"),
            Some(&serde_json::Value::Bool(false))
        );
    }

    #[test]
    fn test_payload_defaults_when_absent() {
        let json = r#"{"id":"evt_2","bounty_id":"b","type":"transfer_failed","amount":0,
                       "currency":"usd","occurred_at":"2026-01-01T00:00:00Z"}"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.payload, EventPayload::default());
    }

    #[test]
    fn test_fund_event_decoding() {
        let capture = PaymentEvent::new("e1", "b1", EventKind::CaptureConfirmed, 5000, "USD")
            .payment_reference("pi_9");
        assert_eq!(
            FundEvent::from_payment_event(&capture).unwrap(),
            FundEvent::CaptureConfirmed {
                amount: 5000,
                currency: "usd".to_string(),
                payment_reference: Some("pi_9".to_string()),
            }
        );

        let zero = PaymentEvent::new("e2", "b1", EventKind::CaptureConfirmed, 0, "usd");
        assert_eq!(
            FundEvent::from_payment_event(&zero),
            Err(TransitionError::ZeroAmount)
        );

        let completed = PaymentEvent::new("e3", "b1", EventKind::BountyCompleted, 0, "usd");
        assert_eq!(
            FundEvent::from_payment_event(&completed),
            Err(TransitionError::MissingField("recipient_id"))
        );

        let full_cancel = PaymentEvent::new("e4", "b1", EventKind::BountyCancelled, 0, "usd");
        assert_eq!(
            FundEvent::from_payment_event(&full_cancel).unwrap(),
            FundEvent::BountyCancelled {
                amount: None,
                reason: None
            }
        );
    }

    #[test]
    fn test_pending_record_split_holds() {
        let record = FundRecord::new_pending("b1", "alice", 10_000, "USD", None, None, Utc::now());
        assert_eq!(record.platform_fee_amount + record.net_amount, record.amount);
        assert_eq!(record.transfer_group, "bounty_b1");
        assert_eq!(record.currency, "usd");
        assert_eq!(record.status, FundStatus::Pending);
    }

    #[test]
    fn test_from_capture_requires_payer() {
        let event = PaymentEvent::new("e1", "b1", EventKind::CaptureConfirmed, 100, "usd");
        assert!(FundRecord::from_capture(&event, Utc::now()).is_none());
        let event = event.payer("alice");
        let record = FundRecord::from_capture(&event, Utc::now()).unwrap();
        assert_eq!(record.payer_id, "alice");
    }

    #[test]
    fn test_ids_parse_roundtrip() {
        let id = FundRecordId::new();
        let parsed: FundRecordId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-ulid".parse::<PayoutId>().is_err());
    }
}

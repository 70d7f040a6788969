//! Transition Validator
//!
//! Pure state machine over fund records:
//!
//! ```text
//! (record, event, fee schedule?) -> Result<Transition, TransitionError>
//! ```
//!
//! No I/O happens here. The ingestion worker looks up the fee schedule before
//! calling in, persists `Transition::next` and the audit entry in one
//! transaction, and only then executes `Transition::effects`.

use chrono::{DateTime, Utc};

use super::error::TransitionError;
use super::notify::{NotificationKind, NotifyTarget};
use super::state::{FundStatus, PayoutKind, TransactionType};
use super::types::{FundEvent, FundRecord, PendingAction, UserId};
use crate::fee::{FeeSchedule, split_fee};
use crate::money::Amount;

/// Bound on asynchronous failures of one outbound movement
pub const MAX_PAYOUT_ATTEMPTS: u32 = 5;

/// How the processor acknowledged a payout attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Completed,
    Failed(Option<String>),
}

/// Work to run after the transition has been committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Issue a new transfer/refund attempt
    Dispatch { kind: PayoutKind },
    /// Close the processing payout attempt with the acknowledged outcome
    SettlePayout {
        kind: PayoutKind,
        reference: Option<String>,
        outcome: PayoutOutcome,
    },
    /// Retry budget spent: fail every remaining attempt for good
    ExhaustPayouts { kind: PayoutKind },
    Notify {
        target: NotifyTarget,
        kind: NotificationKind,
    },
}

/// Audit entry to append in the same transaction as the record update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub tx_type: TransactionType,
    pub user_id: UserId,
    pub amount: Amount,
    pub currency: String,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Record to persist, `version` already bumped
    pub next: FundRecord,
    pub effects: Vec<SideEffect>,
    pub entry: Option<LedgerEntry>,
}

#[derive(Debug, Clone, Copy)]
pub struct TransitionValidator {
    max_attempts: u32,
}

impl Default for TransitionValidator {
    fn default() -> Self {
        Self::new(MAX_PAYOUT_ATTEMPTS)
    }
}

impl TransitionValidator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply `event` to `record`.
    ///
    /// `fees` is only consulted for a capture against a pending record.
    pub fn validate(
        &self,
        record: &FundRecord,
        event: &FundEvent,
        fees: Option<&FeeSchedule>,
        now: DateTime<Utc>,
    ) -> Result<Transition, TransitionError> {
        if record.status.is_terminal() {
            return Err(TransitionError::TerminalState {
                status: record.status,
            });
        }

        let mut next = record.clone();
        next.version = record.version + 1;
        next.updated_at = now;

        match (record.status, event) {
            (
                FundStatus::Pending,
                FundEvent::CaptureConfirmed {
                    amount,
                    currency,
                    payment_reference,
                },
            ) => self.capture(next, *amount, currency, payment_reference.as_deref(), fees),

            (FundStatus::Held, FundEvent::CaptureConfirmed { .. }) => {
                Err(TransitionError::AlreadyApplied("capture"))
            }

            (FundStatus::Pending, other) => Err(TransitionError::Premature(format!(
                "{} before capture confirmation",
                other.name()
            ))),

            (FundStatus::Held, FundEvent::BountyCompleted { recipient_id }) => {
                ensure_idle(record)?;
                next.pending_action = Some(PendingAction::Transfer);
                next.recipient_id = Some(recipient_id.clone());
                next.failed_attempts = 0;
                Ok(Transition {
                    next,
                    effects: vec![SideEffect::Dispatch {
                        kind: PayoutKind::Transfer,
                    }],
                    entry: None,
                })
            }

            (FundStatus::Held, FundEvent::BountyCancelled { amount, reason }) => {
                ensure_idle(record)?;
                let refund = amount.unwrap_or(record.amount);
                if refund == 0 || refund > record.amount {
                    return Err(TransitionError::AmountMismatch {
                        expected: record.amount,
                        actual: refund,
                    });
                }
                next.pending_action = Some(PendingAction::Refund {
                    amount: refund,
                    reason: reason.clone(),
                });
                next.failed_attempts = 0;
                Ok(Transition {
                    next,
                    effects: vec![SideEffect::Dispatch {
                        kind: PayoutKind::Refund,
                    }],
                    entry: None,
                })
            }

            (
                FundStatus::Held,
                FundEvent::TransferSucceeded {
                    amount,
                    currency,
                    reference,
                },
            ) => {
                expect_in_flight(record, PayoutKind::Transfer)?;
                ensure_currency(record, currency)?;
                if *amount != record.net_amount {
                    return Err(TransitionError::AmountMismatch {
                        expected: record.net_amount,
                        actual: *amount,
                    });
                }
                let recipient = record
                    .recipient_id
                    .clone()
                    .ok_or(TransitionError::MissingField("recipient_id"))?;

                next.status = FundStatus::Released;
                next.pending_action = None;
                next.flagged = false;
                Ok(Transition {
                    next,
                    effects: vec![
                        SideEffect::SettlePayout {
                            kind: PayoutKind::Transfer,
                            reference: reference.clone(),
                            outcome: PayoutOutcome::Completed,
                        },
                        SideEffect::Notify {
                            target: NotifyTarget::User(recipient.clone()),
                            kind: NotificationKind::PayoutSent,
                        },
                    ],
                    entry: Some(LedgerEntry {
                        tx_type: TransactionType::Transfer,
                        user_id: recipient,
                        amount: record.net_amount,
                        currency: record.currency.clone(),
                        reference: reference.clone(),
                    }),
                })
            }

            (
                FundStatus::Held,
                FundEvent::RefundSucceeded {
                    amount,
                    currency,
                    reference,
                },
            ) => {
                let Some(PendingAction::Refund {
                    amount: expected,
                    reason,
                }) = &record.pending_action
                else {
                    return Err(not_in_flight(record, PayoutKind::Refund));
                };
                ensure_currency(record, currency)?;
                if amount != expected {
                    return Err(TransitionError::AmountMismatch {
                        expected: *expected,
                        actual: *amount,
                    });
                }

                next.status = FundStatus::Refunded;
                next.refund_amount = Some(*expected);
                next.refund_reason = reason.clone();
                next.pending_action = None;
                next.flagged = false;
                Ok(Transition {
                    next,
                    effects: vec![
                        SideEffect::SettlePayout {
                            kind: PayoutKind::Refund,
                            reference: reference.clone(),
                            outcome: PayoutOutcome::Completed,
                        },
                        SideEffect::Notify {
                            target: NotifyTarget::User(record.payer_id.clone()),
                            kind: NotificationKind::RefundIssued,
                        },
                    ],
                    entry: Some(LedgerEntry {
                        tx_type: TransactionType::Refund,
                        user_id: record.payer_id.clone(),
                        amount: *expected,
                        currency: record.currency.clone(),
                        reference: reference.clone(),
                    }),
                })
            }

            (FundStatus::Held, FundEvent::TransferFailed { reference, error }) => {
                expect_in_flight(record, PayoutKind::Transfer)?;
                self.failure(record, next, PayoutKind::Transfer, reference, error)
            }

            (FundStatus::Held, FundEvent::RefundFailed { reference, error }) => {
                expect_in_flight(record, PayoutKind::Refund)?;
                self.failure(record, next, PayoutKind::Refund, reference, error)
            }

            (status, event) => Err(TransitionError::InvalidTransition(format!(
                "{} on {} record",
                event.name(),
                status
            ))),
        }
    }

    fn capture(
        &self,
        mut next: FundRecord,
        amount: Amount,
        currency: &str,
        payment_reference: Option<&str>,
        fees: Option<&FeeSchedule>,
    ) -> Result<Transition, TransitionError> {
        ensure_currency(&next, currency)?;
        if amount != next.amount {
            return Err(TransitionError::AmountMismatch {
                expected: next.amount,
                actual: amount,
            });
        }
        match (next.payment_reference.as_deref(), payment_reference) {
            (Some(known), Some(seen)) if known != seen => {
                return Err(TransitionError::ReferenceMismatch {
                    expected: known.to_string(),
                    actual: seen.to_string(),
                });
            }
            (None, Some(seen)) => next.payment_reference = Some(seen.to_string()),
            _ => {}
        }

        let schedule = fees.ok_or(TransitionError::FeeScheduleUnavailable)?;
        let split = split_fee(amount, schedule);
        next.platform_fee_amount = split.platform_fee;
        next.net_amount = split.net;
        next.status = FundStatus::Held;

        let entry = LedgerEntry {
            tx_type: TransactionType::PaymentIntent,
            user_id: next.payer_id.clone(),
            amount,
            currency: next.currency.clone(),
            reference: next.payment_reference.clone(),
        };
        let payer = next.payer_id.clone();
        Ok(Transition {
            next,
            effects: vec![SideEffect::Notify {
                target: NotifyTarget::User(payer),
                kind: NotificationKind::FundsHeld,
            }],
            entry: Some(entry),
        })
    }

    /// Bounded retry for asynchronous transfer/refund failures
    fn failure(
        &self,
        record: &FundRecord,
        mut next: FundRecord,
        kind: PayoutKind,
        reference: &Option<String>,
        error: &Option<String>,
    ) -> Result<Transition, TransitionError> {
        if record.flagged {
            return Err(TransitionError::RetriesExhausted {
                attempts: record.failed_attempts,
            });
        }

        next.failed_attempts = record.failed_attempts + 1;
        let mut effects = vec![SideEffect::SettlePayout {
            kind,
            reference: reference.clone(),
            outcome: PayoutOutcome::Failed(error.clone()),
        }];

        if next.failed_attempts >= self.max_attempts {
            next.flagged = true;
            effects.push(SideEffect::ExhaustPayouts { kind });
            effects.push(SideEffect::Notify {
                target: NotifyTarget::Operators,
                kind: NotificationKind::PayoutFlagged,
            });
        } else {
            effects.push(SideEffect::Dispatch { kind });
            if let Some(user) = affected_party(record, kind) {
                effects.push(SideEffect::Notify {
                    target: NotifyTarget::User(user),
                    kind: NotificationKind::PayoutDelayed,
                });
            }
        }

        Ok(Transition {
            next,
            effects,
            entry: None,
        })
    }
}

fn affected_party(record: &FundRecord, kind: PayoutKind) -> Option<UserId> {
    match kind {
        PayoutKind::Transfer => record.recipient_id.clone(),
        PayoutKind::Refund => Some(record.payer_id.clone()),
    }
}

fn ensure_currency(record: &FundRecord, currency: &str) -> Result<(), TransitionError> {
    if record.currency != currency {
        return Err(TransitionError::CurrencyMismatch {
            expected: record.currency.clone(),
            actual: currency.to_string(),
        });
    }
    Ok(())
}

fn ensure_idle(record: &FundRecord) -> Result<(), TransitionError> {
    match record.in_flight() {
        Some(kind) => Err(TransitionError::ActionInProgress(kind)),
        None => Ok(()),
    }
}

fn expect_in_flight(record: &FundRecord, kind: PayoutKind) -> Result<(), TransitionError> {
    if record.in_flight() == Some(kind) {
        Ok(())
    } else {
        Err(not_in_flight(record, kind))
    }
}

/// Acknowledgement for a movement that is not the one in flight
fn not_in_flight(record: &FundRecord, kind: PayoutKind) -> TransitionError {
    match record.in_flight() {
        // Completion/cancellation may still be on its way
        None => TransitionError::Premature(format!("{} acknowledged with nothing in flight", kind)),
        Some(other) => {
            TransitionError::InvalidTransition(format!("{} acknowledged while {} in flight", kind, other))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ten_percent() -> FeeSchedule {
        FeeSchedule {
            platform_fee_rate: 100_000,
            fee_free_allowance_remaining: 0,
        }
    }

    fn pending(amount: Amount) -> FundRecord {
        FundRecord::new_pending("b1", "alice", amount, "usd", None, None, Utc::now())
    }

    fn capture(amount: Amount) -> FundEvent {
        FundEvent::CaptureConfirmed {
            amount,
            currency: "usd".to_string(),
            payment_reference: Some("pi_1".to_string()),
        }
    }

    fn apply(v: &TransitionValidator, record: &FundRecord, event: FundEvent) -> FundRecord {
        v.validate(record, &event, Some(&ten_percent()), Utc::now())
            .unwrap()
            .next
    }

    fn held(amount: Amount) -> FundRecord {
        apply(&TransitionValidator::default(), &pending(amount), capture(amount))
    }

    fn completed(amount: Amount) -> FundRecord {
        apply(
            &TransitionValidator::default(),
            &held(amount),
            FundEvent::BountyCompleted {
                recipient_id: "bob".to_string(),
            },
        )
    }

    fn transfer_failed() -> FundEvent {
        FundEvent::TransferFailed {
            reference: Some("tr_x".to_string()),
            error: Some("account_closed".to_string()),
        }
    }

    #[test]
    fn test_capture_computes_split() {
        let v = TransitionValidator::default();
        let t = v
            .validate(&pending(10_000), &capture(10_000), Some(&ten_percent()), Utc::now())
            .unwrap();

        assert_eq!(t.next.status, FundStatus::Held);
        assert_eq!(t.next.platform_fee_amount, 1_000);
        assert_eq!(t.next.net_amount, 9_000);
        assert_eq!(t.next.version, 1);
        assert_eq!(t.next.payment_reference.as_deref(), Some("pi_1"));

        let entry = t.entry.unwrap();
        assert_eq!(entry.tx_type, TransactionType::PaymentIntent);
        assert_eq!(entry.user_id, "alice");
        assert_eq!(entry.amount, 10_000);
    }

    #[test]
    fn test_capture_amount_mismatch_is_rejected() {
        let v = TransitionValidator::default();
        let err = v
            .validate(&pending(10_000), &capture(9_999), Some(&ten_percent()), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::AmountMismatch {
                expected: 10_000,
                actual: 9_999
            }
        );
    }

    #[test]
    fn test_capture_reference_and_currency_checked() {
        let v = TransitionValidator::default();
        let mut record = pending(10_000);
        record.payment_reference = Some("pi_other".to_string());
        let err = v
            .validate(&record, &capture(10_000), Some(&ten_percent()), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "REFERENCE_MISMATCH");

        let eur = FundEvent::CaptureConfirmed {
            amount: 10_000,
            currency: "eur".to_string(),
            payment_reference: None,
        };
        let err = v
            .validate(&pending(10_000), &eur, Some(&ten_percent()), Utc::now())
            .unwrap_err();
        assert_eq!(err.code(), "CURRENCY_MISMATCH");
    }

    #[test]
    fn test_capture_requires_fee_schedule() {
        let v = TransitionValidator::default();
        let err = v
            .validate(&pending(10_000), &capture(10_000), None, Utc::now())
            .unwrap_err();
        assert_eq!(err, TransitionError::FeeScheduleUnavailable);
    }

    #[test]
    fn test_replayed_capture_is_already_applied() {
        let v = TransitionValidator::default();
        let err = v
            .validate(&held(10_000), &capture(10_000), Some(&ten_percent()), Utc::now())
            .unwrap_err();
        assert!(err.is_expected());
    }

    #[test]
    fn test_completion_before_capture_is_premature() {
        let v = TransitionValidator::default();
        let err = v
            .validate(
                &pending(10_000),
                &FundEvent::BountyCompleted {
                    recipient_id: "bob".to_string(),
                },
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_completion_dispatches_transfer() {
        let v = TransitionValidator::default();
        let t = v
            .validate(
                &held(10_000),
                &FundEvent::BountyCompleted {
                    recipient_id: "bob".to_string(),
                },
                None,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(t.next.status, FundStatus::Held);
        assert_eq!(t.next.pending_action, Some(PendingAction::Transfer));
        assert_eq!(t.next.recipient_id.as_deref(), Some("bob"));
        assert_eq!(
            t.effects,
            vec![SideEffect::Dispatch {
                kind: PayoutKind::Transfer
            }]
        );
        assert!(t.entry.is_none());
    }

    #[test]
    fn test_second_completion_is_rejected() {
        let v = TransitionValidator::default();
        let err = v
            .validate(
                &completed(10_000),
                &FundEvent::BountyCancelled {
                    amount: None,
                    reason: None,
                },
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err, TransitionError::ActionInProgress(PayoutKind::Transfer));
    }

    #[test]
    fn test_transfer_success_releases() {
        let v = TransitionValidator::default();
        let t = v
            .validate(
                &completed(10_000),
                &FundEvent::TransferSucceeded {
                    amount: 9_000,
                    currency: "usd".to_string(),
                    reference: Some("tr_1".to_string()),
                },
                None,
                Utc::now(),
            )
            .unwrap();

        assert_eq!(t.next.status, FundStatus::Released);
        assert!(t.next.pending_action.is_none());
        let entry = t.entry.unwrap();
        assert_eq!(entry.tx_type, TransactionType::Transfer);
        assert_eq!(entry.user_id, "bob");
        assert_eq!(entry.amount, 9_000);
    }

    #[test]
    fn test_transfer_success_with_wrong_amount() {
        let v = TransitionValidator::default();
        let err = v
            .validate(
                &completed(10_000),
                &FundEvent::TransferSucceeded {
                    amount: 10_000,
                    currency: "usd".to_string(),
                    reference: None,
                },
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(err.needs_review());
    }

    #[test]
    fn test_transfer_ack_with_nothing_in_flight_is_premature() {
        let v = TransitionValidator::default();
        let err = v
            .validate(&held(10_000), &transfer_failed(), None, Utc::now())
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_cancel_then_refund() {
        let v = TransitionValidator::default();
        let cancelled = apply(
            &v,
            &held(5_000),
            FundEvent::BountyCancelled {
                amount: None,
                reason: Some("requester_cancelled".to_string()),
            },
        );
        assert_eq!(cancelled.in_flight(), Some(PayoutKind::Refund));

        let t = v
            .validate(
                &cancelled,
                &FundEvent::RefundSucceeded {
                    amount: 5_000,
                    currency: "usd".to_string(),
                    reference: Some("re_1".to_string()),
                },
                None,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.next.status, FundStatus::Refunded);
        assert_eq!(t.next.refund_amount, Some(5_000));
        assert_eq!(t.next.refund_reason.as_deref(), Some("requester_cancelled"));
        assert_eq!(t.entry.unwrap().user_id, "alice");
    }

    #[test]
    fn test_partial_refund_over_amount_is_rejected() {
        let v = TransitionValidator::default();
        let err = v
            .validate(
                &held(5_000),
                &FundEvent::BountyCancelled {
                    amount: Some(5_001),
                    reason: None,
                },
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.code(), "AMOUNT_MISMATCH");
    }

    #[test]
    fn test_terminal_rejects_everything() {
        let v = TransitionValidator::default();
        let mut released = completed(10_000);
        released.status = FundStatus::Released;
        for event in [
            capture(10_000),
            FundEvent::BountyCompleted {
                recipient_id: "carol".to_string(),
            },
            transfer_failed(),
        ] {
            let err = v
                .validate(&released, &event, Some(&ten_percent()), Utc::now())
                .unwrap_err();
            assert_eq!(
                err,
                TransitionError::TerminalState {
                    status: FundStatus::Released
                }
            );
        }
    }

    #[test]
    fn test_failures_retry_until_flagged() {
        let v = TransitionValidator::default();
        let mut record = completed(10_000);

        for attempt in 1..MAX_PAYOUT_ATTEMPTS {
            let t = v
                .validate(&record, &transfer_failed(), None, Utc::now())
                .unwrap();
            assert_eq!(t.next.failed_attempts, attempt);
            assert!(!t.next.flagged);
            assert!(t.effects.contains(&SideEffect::Dispatch {
                kind: PayoutKind::Transfer
            }));
            record = t.next;
        }

        let t = v
            .validate(&record, &transfer_failed(), None, Utc::now())
            .unwrap();
        assert!(t.next.flagged);
        assert_eq!(t.next.status, FundStatus::Held);
        assert!(
            !t.effects
                .iter()
                .any(|e| matches!(e, SideEffect::Dispatch { .. }))
        );
        assert!(t.effects.contains(&SideEffect::ExhaustPayouts {
            kind: PayoutKind::Transfer
        }));

        let err = v
            .validate(&t.next, &transfer_failed(), None, Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            TransitionError::RetriesExhausted {
                attempts: MAX_PAYOUT_ATTEMPTS
            }
        );
    }

    #[test]
    fn test_late_success_clears_flag() {
        let v = TransitionValidator::new(1);
        let flagged = apply(&v, &completed(10_000), transfer_failed());
        assert!(flagged.flagged);

        let t = v
            .validate(
                &flagged,
                &FundEvent::TransferSucceeded {
                    amount: 9_000,
                    currency: "usd".to_string(),
                    reference: None,
                },
                None,
                Utc::now(),
            )
            .unwrap();
        assert_eq!(t.next.status, FundStatus::Released);
        assert!(!t.next.flagged);
    }

    #[test]
    fn test_split_invariant_on_every_state() {
        let v = TransitionValidator::default();
        let record = pending(12_345);
        assert_eq!(record.platform_fee_amount + record.net_amount, record.amount);
        let held = apply(&v, &record, capture(12_345));
        assert_eq!(held.platform_fee_amount + held.net_amount, held.amount);
        assert_eq!(held.platform_fee_amount, 1_235);
    }
}

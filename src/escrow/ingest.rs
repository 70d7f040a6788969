//! Event Ingestion
//!
//! Applies one inbound [`PaymentEvent`] to the ledger:
//!
//! 1. claim the event id in the idempotency ledger (duplicate => no-op)
//! 2. seed a pending record for a first-seen capture
//! 3. lock the fund row, consult the fee schedule, run the validator
//! 4. write the versioned record and audit entry, commit
//! 5. run side effects (dispatch, payout settlement, notifications)
//!
//! Premature events roll back entirely, including the claim, so redelivery
//! can apply them later. Every other validator rejection commits the claim.
//!
//! `payout_paid` events do not move a fund record. They append a `payout`
//! audit entry against a released fund, which is what user balances count
//! as disbursed.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::dispatcher::PayoutDispatcher;
use super::error::{DispatchError, IngestError, StoreError, TransitionError};
use super::notify::{Notification, NotificationKind, Notifier, NotifyTarget};
use super::state::{FundStatus, PayoutKind, TransactionType};
use super::store::{LedgerStore, LedgerTx};
use super::types::{
    EventKind, FundEvent, FundRecord, PaymentEvent, TransactionId, TransactionRecord,
};
use super::validator::{LedgerEntry, SideEffect, TransitionValidator};
use crate::fee::FeeScheduleSource;
use crate::money::{Amount, normalize_currency};

/// Outcome of ingesting one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestResult {
    /// Transition committed
    Applied { status: FundStatus, version: i64 },
    /// Event id already processed
    Duplicate,
    /// Terminal for this event id; the claim was committed
    Rejected(TransitionError),
    /// Rolled back; redeliver later
    Deferred(TransitionError),
}

impl IngestResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestResult::Applied { .. } => "applied",
            IngestResult::Duplicate => "duplicate",
            IngestResult::Rejected(_) => "rejected",
            IngestResult::Deferred(_) => "deferred",
        }
    }
}

pub struct IngestionEngine {
    store: Arc<dyn LedgerStore>,
    fees: Arc<dyn FeeScheduleSource>,
    dispatcher: Arc<PayoutDispatcher>,
    notifier: Arc<dyn Notifier>,
    validator: TransitionValidator,
    operator_id: String,
}

impl IngestionEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        fees: Arc<dyn FeeScheduleSource>,
        dispatcher: Arc<PayoutDispatcher>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let validator = TransitionValidator::new(dispatcher.max_attempts());
        Self {
            store,
            fees,
            dispatcher,
            notifier,
            validator,
            operator_id: "operators".to_string(),
        }
    }

    pub fn with_validator(mut self, validator: TransitionValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Recipient of operator alerts
    pub fn with_operator_id(mut self, operator_id: impl Into<String>) -> Self {
        self.operator_id = operator_id.into();
        self
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Arc<PayoutDispatcher> {
        &self.dispatcher
    }

    /// Register a fund at checkout, before the capture webhook arrives.
    ///
    /// Idempotent per bounty: the already stored record is returned.
    pub async fn open_fund(
        &self,
        bounty_id: &str,
        payer_id: &str,
        amount: Amount,
        currency: &str,
        payment_reference: Option<String>,
        transfer_group: Option<String>,
    ) -> Result<FundRecord, IngestError> {
        if amount == 0 {
            return Err(TransitionError::ZeroAmount.into());
        }
        let record = FundRecord::new_pending(
            bounty_id,
            payer_id,
            amount,
            currency,
            payment_reference,
            transfer_group,
            Utc::now(),
        );
        let stored = self.store.open_fund(&record).await?;
        if stored.id == record.id {
            info!(bounty_id, payer_id, amount, "Fund opened");
        } else {
            debug!(bounty_id, "Fund already open");
        }
        Ok(stored)
    }

    /// Apply one event. `Err` means nothing was committed and the event
    /// should be retried.
    pub async fn ingest(&self, event: &PaymentEvent) -> Result<IngestResult, IngestError> {
        let now = Utc::now();
        let mut tx = self.store.begin().await?;

        if !tx.claim_event(&event.id, now).await? {
            tx.rollback().await?;
            debug!(event_id = %event.id, bounty_id = %event.bounty_id, "Duplicate event");
            return Ok(IngestResult::Duplicate);
        }

        if event.kind == EventKind::PayoutPaid {
            return self.disburse(tx, event, now).await;
        }

        let fund_event = match FundEvent::from_payment_event(event) {
            Ok(e) => e,
            Err(e) => {
                tx.commit().await?;
                log_rejection(event, &e);
                return Ok(IngestResult::Rejected(e));
            }
        };

        if event.kind.is_capture() {
            if let Some(seed) = FundRecord::from_capture(event, now) {
                tx.insert_fund_if_absent(&seed).await?;
            }
        }

        let Some(record) = tx.lock_fund(&event.bounty_id).await? else {
            if event.kind.is_capture() {
                tx.commit().await?;
                let e = TransitionError::MissingField("payer_id");
                log_rejection(event, &e);
                return Ok(IngestResult::Rejected(e));
            }
            tx.rollback().await?;
            let e = TransitionError::Premature(format!("no fund record for {}", event.kind));
            debug!(event_id = %event.id, bounty_id = %event.bounty_id, "Event deferred: unknown bounty");
            return Ok(IngestResult::Deferred(e));
        };

        let schedule = if event.kind.is_capture() && record.status == FundStatus::Pending {
            Some(
                self.fees
                    .fee_schedule(&record.payer_id, event.occurred_at)
                    .await?,
            )
        } else {
            None
        };

        let transition = match self
            .validator
            .validate(&record, &fund_event, schedule.as_ref(), now)
        {
            Ok(t) => t,
            Err(e) if e.is_retryable() => {
                tx.rollback().await?;
                debug!(
                    event_id = %event.id,
                    bounty_id = %event.bounty_id,
                    reason = %e,
                    "Event deferred"
                );
                return Ok(IngestResult::Deferred(e));
            }
            Err(e) => {
                tx.commit().await?;
                log_rejection(event, &e);
                return Ok(IngestResult::Rejected(e));
            }
        };

        if !tx.update_fund(&transition.next, record.version).await? {
            tx.rollback().await?;
            return Err(StoreError::VersionConflict(record.bounty_id.clone()).into());
        }
        if let Some(entry) = &transition.entry {
            tx.append_transaction(&audit_entry(&transition.next, entry, &event.id, now))
                .await?;
        }
        tx.commit().await?;

        let next = &transition.next;
        info!(
            event_id = %event.id,
            bounty_id = %next.bounty_id,
            event_type = %event.kind,
            from = %record.status,
            to = %next.status,
            version = next.version,
            flagged = next.flagged,
            "Transition applied"
        );

        self.run_effects(next, &transition.effects).await;

        Ok(IngestResult::Applied {
            status: next.status,
            version: next.version,
        })
    }

    /// Append a `payout` entry for money leaving the recipient's balance.
    ///
    /// The event id is already claimed in `tx`. Disbursements of one fund are
    /// serialized by the fund lock and may not exceed its net amount in total.
    async fn disburse(
        &self,
        mut tx: Box<dyn LedgerTx>,
        event: &PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestResult, IngestError> {
        if event.amount == 0 {
            tx.commit().await?;
            let e = TransitionError::ZeroAmount;
            log_rejection(event, &e);
            return Ok(IngestResult::Rejected(e));
        }

        let Some(record) = tx.lock_fund(&event.bounty_id).await? else {
            tx.rollback().await?;
            debug!(event_id = %event.id, bounty_id = %event.bounty_id, "Payout deferred: unknown bounty");
            return Ok(IngestResult::Deferred(TransitionError::Premature(
                "no fund record for payout_paid".to_string(),
            )));
        };

        if let Err(e) = check_disbursable(&record, event) {
            if e.is_retryable() {
                tx.rollback().await?;
                debug!(event_id = %event.id, bounty_id = %event.bounty_id, reason = %e, "Payout deferred");
                return Ok(IngestResult::Deferred(e));
            }
            tx.commit().await?;
            log_rejection(event, &e);
            return Ok(IngestResult::Rejected(e));
        }

        let disbursed: Amount = self
            .store
            .transactions_for_bounty(&record.bounty_id)
            .await?
            .iter()
            .filter(|t| t.tx_type == TransactionType::Payout)
            .map(|t| t.amount)
            .sum();
        let remaining = record.net_amount.saturating_sub(disbursed);
        if event.amount > remaining {
            tx.commit().await?;
            let e = TransitionError::AmountMismatch {
                expected: remaining,
                actual: event.amount,
            };
            log_rejection(event, &e);
            return Ok(IngestResult::Rejected(e));
        }

        let recipient = record.recipient_id.clone().unwrap_or_default();
        let entry = LedgerEntry {
            tx_type: TransactionType::Payout,
            user_id: recipient,
            amount: event.amount,
            currency: record.currency.clone(),
            reference: event.payload.reference.clone(),
        };
        tx.append_transaction(&audit_entry(&record, &entry, &event.id, now))
            .await?;
        tx.commit().await?;

        info!(
            event_id = %event.id,
            bounty_id = %record.bounty_id,
            user_id = %entry.user_id,
            amount = event.amount,
            remaining = remaining - event.amount,
            "Disbursement recorded"
        );
        Ok(IngestResult::Applied {
            status: record.status,
            version: record.version,
        })
    }

    /// Post-commit work. Failures are logged; the ledger state is already
    /// durable and the recovery worker re-drives lost dispatches.
    async fn run_effects(&self, record: &FundRecord, effects: &[SideEffect]) {
        for effect in effects {
            match effect {
                SideEffect::Dispatch { kind } => {
                    match self.dispatcher.dispatch(record.id, *kind).await {
                        Ok(payout) => debug!(
                            bounty_id = %record.bounty_id,
                            payout_id = %payout.id,
                            attempt = payout.attempt,
                            "Dispatch issued"
                        ),
                        Err(
                            e @ (DispatchError::PermanentFailure { .. }
                            | DispatchError::Rejected { .. }
                            | DispatchError::NothingToDispatch(_)),
                        ) => {
                            error!(
                                bounty_id = %record.bounty_id,
                                kind = %kind,
                                code = e.code(),
                                error = %e,
                                "Dispatch failed permanently"
                            );
                            self.notify(&NotifyTarget::Operators, NotificationKind::DispatchFailed, record);
                        }
                        Err(e) => warn!(
                            bounty_id = %record.bounty_id,
                            kind = %kind,
                            error = %e,
                            "Dispatch deferred to recovery"
                        ),
                    }
                }
                SideEffect::SettlePayout {
                    kind,
                    reference,
                    outcome,
                } => {
                    if let Err(e) = self
                        .dispatcher
                        .settle(record.id, *kind, reference.as_deref(), outcome)
                        .await
                    {
                        warn!(bounty_id = %record.bounty_id, kind = %kind, error = %e, "Payout settle failed");
                    }
                }
                SideEffect::ExhaustPayouts { kind } => {
                    if let Err(e) = self.dispatcher.mark_exhausted(record.id, *kind).await {
                        warn!(bounty_id = %record.bounty_id, kind = %kind, error = %e, "Mark exhausted failed");
                    }
                }
                SideEffect::Notify { target, kind } => self.notify(target, *kind, record),
            }
        }
    }

    fn notify(&self, target: &NotifyTarget, kind: NotificationKind, record: &FundRecord) {
        let user_id = match target {
            NotifyTarget::User(user) => user.clone(),
            NotifyTarget::Operators => self.operator_id.clone(),
        };
        self.notifier
            .notify(Notification::new(user_id, kind, &record.bounty_id));
    }
}

/// Whether `record` can have money paid out of it to its recipient
fn check_disbursable(record: &FundRecord, event: &PaymentEvent) -> Result<(), TransitionError> {
    match record.status {
        FundStatus::Released => {}
        FundStatus::Held if record.in_flight() == Some(PayoutKind::Transfer) => {
            return Err(TransitionError::Premature(
                "payout before transfer settled".to_string(),
            ));
        }
        status => {
            return Err(TransitionError::InvalidTransition(format!(
                "payout against {} fund",
                status
            )));
        }
    }
    let currency = normalize_currency(&event.currency);
    if currency != record.currency {
        return Err(TransitionError::CurrencyMismatch {
            expected: record.currency.clone(),
            actual: currency,
        });
    }
    match (&event.payload.recipient_id, &record.recipient_id) {
        (Some(claimed), Some(known)) if claimed != known => Err(TransitionError::InvalidTransition(
            format!("payout to {} but fund was released to {}", claimed, known),
        )),
        (_, None) => Err(TransitionError::MissingField("recipient_id")),
        _ => Ok(()),
    }
}

fn audit_entry(
    record: &FundRecord,
    entry: &LedgerEntry,
    event_id: &str,
    now: DateTime<Utc>,
) -> TransactionRecord {
    TransactionRecord {
        id: TransactionId::new(),
        bounty_id: record.bounty_id.clone(),
        fund_record_id: record.id,
        user_id: entry.user_id.clone(),
        tx_type: entry.tx_type,
        amount: entry.amount,
        currency: entry.currency.clone(),
        processor_reference: entry.reference.clone(),
        event_id: event_id.to_string(),
        created_at: now,
    }
}

fn log_rejection(event: &PaymentEvent, err: &TransitionError) {
    if err.is_expected() {
        debug!(
            event_id = %event.id,
            bounty_id = %event.bounty_id,
            reason = %err,
            "Event is a no-op"
        );
    } else if err.needs_review() {
        error!(
            event_id = %event.id,
            bounty_id = %event.bounty_id,
            event_type = %event.kind,
            code = err.code(),
            reason = %err,
            "Event conflicts with ledger"
        );
    } else {
        warn!(
            event_id = %event.id,
            bounty_id = %event.bounty_id,
            event_type = %event.kind,
            code = err.code(),
            reason = %err,
            "Event rejected"
        );
    }
}

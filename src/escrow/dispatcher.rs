//! Payout Dispatcher
//!
//! Issues transfer/refund commands for funds whose transition asked for one.
//! Every attempt is persisted as a [`PayoutRecord`] before the processor is
//! called, so a crash between the two leaves a visible `pending` attempt.
//!
//! Attempt budget: at most `max_attempts` records per fund per kind, counting
//! synchronous rejections and asynchronous failures alike.

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::DispatchError;
use super::state::{PayoutKind, PayoutStatus};
use super::store::{LedgerStore, attempts_of};
use super::types::{FundRecord, FundRecordId, PayoutRecord, PendingAction, UserId};
use super::validator::PayoutOutcome;
use crate::config::DispatcherConfig;
use crate::money::Amount;
use crate::processor::{PaymentProcessor, ProcessorError, RefundCommand, TransferCommand};

pub struct PayoutDispatcher {
    store: Arc<dyn LedgerStore>,
    processor: Arc<dyn PaymentProcessor>,
    config: DispatcherConfig,
    /// Serializes attempt numbering per fund
    fund_locks: DashMap<FundRecordId, Arc<tokio::sync::Mutex<()>>>,
}

impl PayoutDispatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            fund_locks: DashMap::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    async fn lock(&self, fund_id: FundRecordId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .fund_locks
            .entry(fund_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Issue (or re-issue) the in-flight movement of `kind` for a fund.
    ///
    /// Returns the open attempt if one exists already. Synchronous transient
    /// failures are retried with exponential backoff inside the remaining
    /// budget; a rejection stops immediately.
    pub async fn dispatch(
        &self,
        fund_id: FundRecordId,
        kind: PayoutKind,
    ) -> Result<PayoutRecord, DispatchError> {
        let _guard = self.lock(fund_id).await;

        let fund = self
            .store
            .fund(fund_id)
            .await?
            .ok_or_else(|| DispatchError::FundNotFound(fund_id.to_string()))?;
        let (recipient, amount) = target(&fund, kind)?;

        let payouts = self.store.payouts_for_fund(fund_id).await?;
        if let Some(open) = attempts_of(&payouts, kind).find(|p| !p.status.is_final()) {
            debug!(
                bounty_id = %fund.bounty_id,
                payout_id = %open.id,
                attempt = open.attempt,
                "Attempt already in flight"
            );
            return Ok(open.clone());
        }

        let mut used = attempts_of(&payouts, kind).count() as u32;
        loop {
            if used >= self.config.max_attempts {
                error!(
                    bounty_id = %fund.bounty_id,
                    kind = %kind,
                    attempts = used,
                    "Payout attempts exhausted"
                );
                return Err(DispatchError::PermanentFailure {
                    kind,
                    attempts: used,
                });
            }
            used += 1;

            let mut payout = PayoutRecord::new(&fund, kind, recipient.clone(), amount, used);
            self.store.insert_payout(&payout).await?;

            match self.call(&fund, &payout).await {
                Ok(reference) => {
                    payout.status = PayoutStatus::Processing;
                    payout.transfer_reference = Some(reference);
                    payout.updated_at = Utc::now();
                    self.store
                        .update_payout(&payout, PayoutStatus::Pending)
                        .await?;
                    info!(
                        bounty_id = %fund.bounty_id,
                        kind = %kind,
                        attempt = used,
                        reference = ?payout.transfer_reference,
                        "Payout accepted by processor"
                    );
                    return Ok(payout);
                }
                Err(e) => {
                    payout.status = PayoutStatus::Failed;
                    payout.last_error = Some(e.to_string());
                    payout.updated_at = Utc::now();
                    self.store
                        .update_payout(&payout, PayoutStatus::Pending)
                        .await?;

                    if !e.is_retryable() {
                        warn!(
                            bounty_id = %fund.bounty_id,
                            kind = %kind,
                            attempt = used,
                            error = %e,
                            "Payout rejected by processor"
                        );
                        return Err(DispatchError::Rejected {
                            kind,
                            reason: e.to_string(),
                        });
                    }

                    warn!(
                        bounty_id = %fund.bounty_id,
                        kind = %kind,
                        attempt = used,
                        error = %e,
                        "Transient dispatch error, retrying"
                    );
                    if used < self.config.max_attempts {
                        tokio::time::sleep(self.backoff(used)).await;
                    }
                }
            }
        }
    }

    /// Close the attempt an acknowledgement refers to.
    ///
    /// Matches on the processor reference when given, else the latest open
    /// attempt. Returns `None` if no open attempt exists.
    pub async fn settle(
        &self,
        fund_id: FundRecordId,
        kind: PayoutKind,
        reference: Option<&str>,
        outcome: &PayoutOutcome,
    ) -> Result<Option<PayoutRecord>, DispatchError> {
        let _guard = self.lock(fund_id).await;

        let payouts = self.store.payouts_for_fund(fund_id).await?;
        let open: Vec<&PayoutRecord> = attempts_of(&payouts, kind)
            .filter(|p| !p.status.is_final())
            .collect();
        let matched = reference
            .and_then(|r| {
                open.iter()
                    .find(|p| p.transfer_reference.as_deref() == Some(r))
            })
            .or_else(|| open.iter().max_by_key(|p| p.attempt));

        let Some(current) = matched else {
            debug!(fund_id = %fund_id, kind = %kind, "No open attempt to settle");
            return Ok(None);
        };

        let mut payout = (*current).clone();
        let expected = payout.status;
        match outcome {
            PayoutOutcome::Completed => payout.status = PayoutStatus::Completed,
            PayoutOutcome::Failed(err) => {
                payout.status = PayoutStatus::Failed;
                payout.last_error = err.clone().or_else(|| Some("failed at processor".to_string()));
            }
        }
        if payout.transfer_reference.is_none() {
            payout.transfer_reference = reference.map(str::to_string);
        }
        payout.updated_at = Utc::now();

        if !self.store.update_payout(&payout, expected).await? {
            warn!(payout_id = %payout.id, "Payout changed while settling");
            return Ok(None);
        }
        debug!(
            payout_id = %payout.id,
            kind = %kind,
            status = %payout.status,
            "Payout settled"
        );
        Ok(Some(payout))
    }

    /// Fail every open attempt of `kind` for good
    pub async fn mark_exhausted(
        &self,
        fund_id: FundRecordId,
        kind: PayoutKind,
    ) -> Result<usize, DispatchError> {
        let _guard = self.lock(fund_id).await;

        let payouts = self.store.payouts_for_fund(fund_id).await?;
        let mut closed = 0;
        for open in attempts_of(&payouts, kind).filter(|p| !p.status.is_final()) {
            let mut payout = open.clone();
            payout.status = PayoutStatus::Failed;
            payout.last_error = Some("retry budget exhausted".to_string());
            payout.updated_at = Utc::now();
            if self.store.update_payout(&payout, open.status).await? {
                closed += 1;
            }
        }
        warn!(fund_id = %fund_id, kind = %kind, closed, "Payouts marked exhausted");
        Ok(closed)
    }

    /// Pick up a dispatch interrupted between commit and the processor reply.
    ///
    /// Two cases: the committed transition never got its attempt recorded
    /// (every recorded attempt is closed, and each was answered by an
    /// asynchronous failure), or an attempt is still `pending` because the
    /// call never returned. The latter is re-sent with the same idempotency key.
    pub async fn resume(&self, fund: &FundRecord) -> Result<Option<PayoutRecord>, DispatchError> {
        let Some(kind) = fund.in_flight() else {
            return Ok(None);
        };
        if fund.flagged || fund.status.is_terminal() {
            return Ok(None);
        }

        let payouts = self.store.payouts_for_fund(fund.id).await?;
        if let Some(reason) = stall_reason(fund, &payouts) {
            debug!(
                bounty_id = %fund.bounty_id,
                kind = %kind,
                reason = %reason,
                "Dispatch stalled, left to reconciliation"
            );
            return Ok(None);
        }
        let recorded = attempts_of(&payouts, kind).count() as u32;
        let open = attempts_of(&payouts, kind).any(|p| !p.status.is_final());
        if !open && recorded <= fund.failed_attempts {
            info!(
                bounty_id = %fund.bounty_id,
                kind = %kind,
                recorded,
                "Resuming lost dispatch"
            );
            return self.dispatch(fund.id, kind).await.map(Some);
        }

        let _guard = self.lock(fund.id).await;
        let payouts = self.store.payouts_for_fund(fund.id).await?;
        let Some(stalled) = attempts_of(&payouts, kind).find(|p| p.status == PayoutStatus::Pending)
        else {
            return Ok(None);
        };

        let mut payout = stalled.clone();
        match self.call(fund, &payout).await {
            Ok(reference) => {
                payout.status = PayoutStatus::Processing;
                payout.transfer_reference = Some(reference);
            }
            Err(e) => {
                payout.status = PayoutStatus::Failed;
                payout.last_error = Some(e.to_string());
            }
        }
        payout.updated_at = Utc::now();
        self.store
            .update_payout(&payout, PayoutStatus::Pending)
            .await?;
        info!(
            bounty_id = %fund.bounty_id,
            payout_id = %payout.id,
            status = %payout.status,
            "Stalled payout re-sent"
        );
        Ok(Some(payout))
    }

    async fn call(&self, fund: &FundRecord, payout: &PayoutRecord) -> Result<String, ProcessorError> {
        match payout.kind {
            PayoutKind::Transfer => {
                let cmd = TransferCommand {
                    bounty_id: fund.bounty_id.clone(),
                    transfer_group: fund.transfer_group.clone(),
                    recipient_id: payout.recipient_id.clone(),
                    amount: payout.amount,
                    currency: payout.currency.clone(),
                    idempotency_key: payout.id.to_string(),
                };
                self.processor.create_transfer(&cmd).await
            }
            PayoutKind::Refund => {
                let reason = match &fund.pending_action {
                    Some(PendingAction::Refund { reason, .. }) => reason.clone(),
                    _ => None,
                };
                let cmd = RefundCommand {
                    bounty_id: fund.bounty_id.clone(),
                    payment_reference: fund.payment_reference.clone().unwrap_or_default(),
                    amount: payout.amount,
                    currency: payout.currency.clone(),
                    reason,
                    idempotency_key: payout.id.to_string(),
                };
                self.processor.create_refund(&cmd).await
            }
        }
    }

    /// `base * 2^(attempt-1)`, capped, plus up to 25% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(20));
        let capped = exp.min(self.config.backoff_max_ms);
        let jitter = if capped >= 4 {
            rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Why the movement in flight cannot make progress on its own, if so.
///
/// Either it has no valid target (no recipient, or no payment reference to
/// refund), or its latest attempt was refused synchronously: no attempt is
/// open and more attempts are recorded than asynchronous failures counted,
/// so no failure event will ever ask for the next one.
pub fn stall_reason(fund: &FundRecord, payouts: &[PayoutRecord]) -> Option<String> {
    let kind = fund.in_flight()?;
    if fund.flagged || fund.status.is_terminal() {
        return None;
    }
    if let Err(e) = target(fund, kind) {
        return Some(e.to_string());
    }

    let attempts: Vec<&PayoutRecord> = attempts_of(payouts, kind).collect();
    if attempts.iter().any(|p| !p.status.is_final()) {
        return None;
    }
    let latest = attempts.iter().max_by_key(|p| p.attempt)?;
    if latest.status == PayoutStatus::Failed && attempts.len() as u32 > fund.failed_attempts {
        return Some(
            latest
                .last_error
                .clone()
                .unwrap_or_else(|| "refused by processor".to_string()),
        );
    }
    None
}

/// Who gets paid and how much, for the movement in flight
fn target(fund: &FundRecord, kind: PayoutKind) -> Result<(UserId, Amount), DispatchError> {
    if fund.status.is_terminal() || fund.in_flight() != Some(kind) {
        return Err(DispatchError::NothingToDispatch(format!(
            "fund {} has no {} in flight",
            fund.bounty_id, kind
        )));
    }
    match &fund.pending_action {
        Some(PendingAction::Transfer) => {
            let recipient = fund.recipient_id.clone().ok_or_else(|| {
                DispatchError::NothingToDispatch(format!("fund {} has no recipient", fund.bounty_id))
            })?;
            Ok((recipient, fund.net_amount))
        }
        Some(PendingAction::Refund { amount, .. }) => {
            if fund.payment_reference.is_none() {
                return Err(DispatchError::NothingToDispatch(format!(
                    "fund {} has no payment reference to refund",
                    fund.bounty_id
                )));
            }
            Ok((fund.payer_id.clone(), *amount))
        }
        None => Err(DispatchError::NothingToDispatch(fund.bounty_id.clone())),
    }
}

#[cfg(all(test, feature = "mock-api"))]
mod tests {
    use super::*;
    use crate::escrow::state::FundStatus;
    use crate::escrow::store::MemoryLedgerStore;
    use crate::processor::SandboxProcessor;

    fn config() -> DispatcherConfig {
        DispatcherConfig {
            max_attempts: 5,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            ..DispatcherConfig::default()
        }
    }

    async fn setup(
        action: PendingAction,
    ) -> (PayoutDispatcher, Arc<MemoryLedgerStore>, Arc<SandboxProcessor>, FundRecord) {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        let mut fund = FundRecord::new_pending(
            "b1",
            "alice",
            10_000,
            "usd",
            Some("pi_1".to_string()),
            None,
            Utc::now(),
        );
        fund.status = FundStatus::Held;
        fund.platform_fee_amount = 1_000;
        fund.net_amount = 9_000;
        fund.recipient_id = Some("bob".to_string());
        fund.pending_action = Some(action);
        let fund = store.open_fund(&fund).await.unwrap();

        let dispatcher = PayoutDispatcher::new(store.clone(), processor.clone(), config());
        (dispatcher, store, processor, fund)
    }

    #[tokio::test]
    async fn test_transfer_dispatched_with_net_amount() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        let payout = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();

        assert_eq!(payout.status, PayoutStatus::Processing);
        assert_eq!(payout.amount, 9_000);
        assert_eq!(payout.recipient_id, "bob");
        assert_eq!(payout.attempt, 1);
        assert!(payout.transfer_reference.is_some());
        assert_eq!(processor.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_redispatch_returns_open_attempt() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        let first = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();
        let second = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(processor.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (dispatcher, store, processor, fund) = setup(PendingAction::Transfer).await;
        processor.script_transfer(Err(ProcessorError::Transient("503".into())));
        processor.script_transfer(Err(ProcessorError::Transient("timeout".into())));

        let payout = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();
        assert_eq!(payout.attempt, 3);
        assert_eq!(processor.transfer_calls(), 3);

        let statuses: Vec<PayoutStatus> = store
            .payouts_for_fund(fund.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                PayoutStatus::Failed,
                PayoutStatus::Failed,
                PayoutStatus::Processing
            ]
        );
    }

    #[tokio::test]
    async fn test_rejection_stops_retrying() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        processor.script_transfer(Err(ProcessorError::Rejected("account closed".into())));

        let err = dispatcher
            .dispatch(fund.id, PayoutKind::Transfer)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "PROCESSOR_REJECTED");
        assert_eq!(processor.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let (dispatcher, store, processor, fund) = setup(PendingAction::Transfer).await;
        for _ in 0..5 {
            processor.script_transfer(Err(ProcessorError::Transient("503".into())));
        }

        let err = dispatcher
            .dispatch(fund.id, PayoutKind::Transfer)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::PermanentFailure { attempts: 5, .. }
        ));
        assert_eq!(processor.transfer_calls(), 5);

        // No sixth call
        assert!(dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.is_err());
        assert_eq!(processor.transfer_calls(), 5);
        assert_eq!(store.payouts_for_fund(fund.id).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_settle_matches_reference() {
        let (dispatcher, _, _, fund) = setup(PendingAction::Transfer).await;
        let payout = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();

        let settled = dispatcher
            .settle(
                fund.id,
                PayoutKind::Transfer,
                payout.transfer_reference.as_deref(),
                &PayoutOutcome::Completed,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.id, payout.id);
        assert_eq!(settled.status, PayoutStatus::Completed);

        // Nothing left open
        let again = dispatcher
            .settle(fund.id, PayoutKind::Transfer, None, &PayoutOutcome::Completed)
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_mark_exhausted_fails_open_attempts() {
        let (dispatcher, store, _, fund) = setup(PendingAction::Transfer).await;
        dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();

        assert_eq!(
            dispatcher
                .mark_exhausted(fund.id, PayoutKind::Transfer)
                .await
                .unwrap(),
            1
        );
        let payouts = store.payouts_for_fund(fund.id).await.unwrap();
        assert!(payouts.iter().all(|p| p.status == PayoutStatus::Failed));
    }

    #[tokio::test]
    async fn test_refund_goes_to_payer() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Refund {
            amount: 4_000,
            reason: Some("duplicate".to_string()),
        })
        .await;
        let payout = dispatcher.dispatch(fund.id, PayoutKind::Refund).await.unwrap();

        assert_eq!(payout.recipient_id, "alice");
        assert_eq!(payout.amount, 4_000);
        assert_eq!(processor.refunds()[0].payment_reference, "pi_1");
    }

    #[tokio::test]
    async fn test_wrong_kind_is_nothing_to_dispatch() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        let err = dispatcher
            .dispatch(fund.id, PayoutKind::Refund)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOTHING_TO_DISPATCH");
        assert_eq!(processor.refund_calls(), 0);
    }

    #[tokio::test]
    async fn test_resume_dispatches_when_nothing_recorded() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        let resumed = dispatcher.resume(&fund).await.unwrap().unwrap();
        assert_eq!(resumed.status, PayoutStatus::Processing);
        assert_eq!(processor.transfer_calls(), 1);

        // Attempt now open: nothing more to do
        assert!(dispatcher.resume(&fund).await.unwrap().is_none());
        assert_eq!(processor.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_resume_resends_stalled_attempt() {
        let (dispatcher, store, processor, fund) = setup(PendingAction::Transfer).await;
        let stalled = PayoutRecord::new(&fund, PayoutKind::Transfer, "bob".into(), 9_000, 1);
        store.insert_payout(&stalled).await.unwrap();

        let resumed = dispatcher.resume(&fund).await.unwrap().unwrap();
        assert_eq!(resumed.id, stalled.id);
        assert_eq!(resumed.status, PayoutStatus::Processing);
        assert_eq!(processor.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_skips_rejected_dispatch() {
        let (dispatcher, _, processor, fund) = setup(PendingAction::Transfer).await;
        processor.script_transfer(Err(ProcessorError::Rejected("account closed".into())));
        assert!(dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.is_err());

        // One failed attempt, no asynchronous failure on record
        assert!(dispatcher.resume(&fund).await.unwrap().is_none());
        assert_eq!(processor.transfer_calls(), 1);
    }

    #[tokio::test]
    async fn test_refund_without_payment_reference_is_stalled() {
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = Arc::new(SandboxProcessor::new());
        let mut fund = FundRecord::new_pending("b9", "alice", 10_000, "usd", None, None, Utc::now());
        fund.status = FundStatus::Held;
        fund.net_amount = 9_000;
        fund.pending_action = Some(PendingAction::Refund {
            amount: 10_000,
            reason: None,
        });
        let fund = store.open_fund(&fund).await.unwrap();
        let dispatcher = PayoutDispatcher::new(store.clone(), processor.clone(), config());

        let reason = stall_reason(&fund, &[]).unwrap();
        assert!(reason.contains("no payment reference"));

        // Recovery scans leave it alone instead of failing on every pass
        for _ in 0..3 {
            assert!(dispatcher.resume(&fund).await.unwrap().is_none());
        }
        assert_eq!(processor.refund_calls(), 0);
        assert!(store.payouts_for_fund(fund.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stall_reason_after_rejection() {
        let (dispatcher, store, processor, fund) = setup(PendingAction::Transfer).await;
        assert!(stall_reason(&fund, &[]).is_none());

        processor.script_transfer(Err(ProcessorError::Rejected("account closed".into())));
        assert!(dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.is_err());
        let payouts = store.payouts_for_fund(fund.id).await.unwrap();
        let reason = stall_reason(&fund, &payouts).unwrap();
        assert!(reason.contains("account closed"));

        // An asynchronous failure on record means a retry is still owed
        let mut counted = fund.clone();
        counted.failed_attempts = 1;
        assert!(stall_reason(&counted, &payouts).is_none());

        let mut flagged = fund;
        flagged.flagged = true;
        assert!(stall_reason(&flagged, &payouts).is_none());
    }

    #[tokio::test]
    async fn test_resume_after_lost_redispatch() {
        let (dispatcher, _, processor, mut fund) = setup(PendingAction::Transfer).await;
        let first = dispatcher.dispatch(fund.id, PayoutKind::Transfer).await.unwrap();
        dispatcher
            .settle(
                fund.id,
                PayoutKind::Transfer,
                first.transfer_reference.as_deref(),
                &PayoutOutcome::Failed(None),
            )
            .await
            .unwrap();
        fund.failed_attempts = 1;

        let resumed = dispatcher.resume(&fund).await.unwrap().unwrap();
        assert_eq!(resumed.attempt, 2);
        assert_eq!(processor.transfer_calls(), 2);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
        let dispatcher = PayoutDispatcher::new(
            store,
            Arc::new(SandboxProcessor::new()),
            DispatcherConfig {
                max_attempts: 5,
                backoff_base_ms: 100,
                backoff_max_ms: 1_000,
                ..DispatcherConfig::default()
            },
        );
        let first = dispatcher.backoff(1).as_millis();
        assert!((100..=125).contains(&first));
        let third = dispatcher.backoff(3).as_millis();
        assert!((400..=500).contains(&third));
        let capped = dispatcher.backoff(10).as_millis();
        assert!((1_000..=1_250).contains(&capped));
    }
}

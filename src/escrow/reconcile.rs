//! Reconciliation Job
//!
//! Compares stale non-terminal and flagged fund records against the
//! processor's authoritative payment, transfer and refund objects. Every
//! disagreement is stored as a [`ReconciliationDiscrepancy`] carrying both
//! views for an operator. The job never modifies fund or payout records.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::error::ReconcileError;
use super::state::{DiscrepancyKind, FundStatus, PayoutKind, PayoutStatus};
use super::dispatcher::stall_reason;
use super::store::{LedgerStore, attempts_of, has_discrepancy};
use super::types::{DiscrepancyId, FundRecord, PayoutRecord, ReconciliationDiscrepancy};
use super::validator::MAX_PAYOUT_ATTEMPTS;
use super::worker::ShutdownSignal;
use crate::config::ReconciliationConfig;
use crate::money::Amount;
use crate::processor::{PaymentProcessor, ProcessorError, RemoteStatus};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub examined: usize,
    /// New discrepancies recorded this run
    pub discrepancies: usize,
    /// Records skipped because a query failed
    pub errors: usize,
}

pub struct ReconciliationJob {
    store: Arc<dyn LedgerStore>,
    processor: Arc<dyn PaymentProcessor>,
    config: ReconciliationConfig,
    max_attempts: u32,
}

/// One finding before it is persisted
struct Finding {
    kind: DiscrepancyKind,
    local: Value,
    remote: Value,
}

impl ReconciliationJob {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        processor: Arc<dyn PaymentProcessor>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            store,
            processor,
            config,
            max_attempts: MAX_PAYOUT_ATTEMPTS,
        }
    }

    /// Attempt budget used to detect exhausted payouts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Run every `interval_secs` until shutdown
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        if !self.config.enabled {
            info!("Reconciliation disabled");
            return;
        }
        let interval = Duration::from_secs(self.config.interval_secs.max(1));
        info!(
            interval_secs = interval.as_secs(),
            grace_period_secs = self.config.grace_period_secs,
            "Starting reconciliation job"
        );

        while !shutdown.is_shutdown_requested() {
            match self.run_once(Utc::now(), &shutdown).await {
                Ok(report) => info!(
                    examined = report.examined,
                    discrepancies = report.discrepancies,
                    errors = report.errors,
                    "Reconciliation run complete"
                ),
                Err(e) => error!(error = %e, "Reconciliation run failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.wait() => {}
            }
        }
        info!("Reconciliation job stopped");
    }

    /// Examine one batch of candidates; stops between records on shutdown
    pub async fn run_once(
        &self,
        now: DateTime<Utc>,
        shutdown: &ShutdownSignal,
    ) -> Result<ReconciliationReport, ReconcileError> {
        let grace = chrono::Duration::from_std(Duration::from_secs(self.config.grace_period_secs))
            .unwrap_or_else(|_| chrono::Duration::zero());
        let funds = self
            .store
            .funds_for_reconciliation(now - grace, self.config.batch_size)
            .await?;

        let mut report = ReconciliationReport::default();
        for fund in &funds {
            if shutdown.is_shutdown_requested() {
                info!(examined = report.examined, "Reconciliation interrupted by shutdown");
                break;
            }
            report.examined += 1;
            match self.reconcile_fund(fund, now).await {
                Ok(found) => report.discrepancies += found,
                Err(e) => {
                    warn!(bounty_id = %fund.bounty_id, error = %e, "Reconciliation skipped record");
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Compare one record; returns the number of new discrepancies stored
    pub async fn reconcile_fund(
        &self,
        fund: &FundRecord,
        now: DateTime<Utc>,
    ) -> Result<usize, ReconcileError> {
        let payouts = self.store.payouts_for_fund(fund.id).await?;
        let (capture, transfers, refunds) = futures::try_join!(
            self.check_capture(fund),
            self.check_transfers(fund, &payouts),
            self.check_refunds(fund, &payouts),
        )?;
        let exhausted = self.check_exhausted(fund, &payouts);
        let stalled = match exhausted {
            Some(_) => None,
            None => check_stalled(fund, &payouts),
        };
        let findings: Vec<Finding> = [capture, transfers, refunds, exhausted, stalled]
            .into_iter()
            .flatten()
            .collect();

        if findings.is_empty() {
            debug!(bounty_id = %fund.bounty_id, "Fund reconciled");
            return Ok(0);
        }

        let existing = self.store.discrepancies_for_fund(fund.id).await?;
        let mut stored = 0;
        for finding in findings {
            if has_discrepancy(&existing, finding.kind) {
                continue;
            }
            error!(
                bounty_id = %fund.bounty_id,
                kind = finding.kind.as_str(),
                local = %finding.local,
                processor = %finding.remote,
                "Reconciliation discrepancy"
            );
            self.store
                .insert_discrepancy(&ReconciliationDiscrepancy {
                    id: DiscrepancyId::new(),
                    fund_record_id: fund.id,
                    bounty_id: fund.bounty_id.clone(),
                    kind: finding.kind,
                    local_view: finding.local,
                    processor_view: finding.remote,
                    detected_at: now,
                })
                .await?;
            stored += 1;
        }
        Ok(stored)
    }

    async fn check_capture(&self, fund: &FundRecord) -> Result<Option<Finding>, ReconcileError> {
        let Some(reference) = fund.payment_reference.as_deref() else {
            return Ok(None);
        };
        let local_captured = if fund.status == FundStatus::Pending {
            0
        } else {
            fund.amount
        };

        let payment = match self.processor.retrieve_payment(reference).await {
            Ok(p) => p,
            Err(ProcessorError::NotFound(_)) => {
                return Ok(Some(Finding {
                    kind: DiscrepancyKind::MissingAtProcessor,
                    local: json!({ "payment_reference": reference, "status": fund.status }),
                    remote: Value::Null,
                }));
            }
            Err(e) => return Err(e.into()),
        };

        let remote_captured = match payment.status {
            RemoteStatus::Succeeded => payment.amount_captured,
            _ => 0,
        };
        if remote_captured == local_captured && payment.currency == fund.currency {
            return Ok(None);
        }
        Ok(Some(Finding {
            kind: DiscrepancyKind::CapturedAmount,
            local: json!({
                "status": fund.status,
                "amount": local_captured,
                "currency": fund.currency,
            }),
            remote: json!(payment),
        }))
    }

    async fn check_transfers(
        &self,
        fund: &FundRecord,
        payouts: &[PayoutRecord],
    ) -> Result<Option<Finding>, ReconcileError> {
        let local: Vec<&PayoutRecord> = attempts_of(payouts, PayoutKind::Transfer).collect();
        if local.is_empty() && fund.status != FundStatus::Released {
            return Ok(None);
        }
        let remote = self.processor.list_transfers(&fund.transfer_group).await?;

        let local_completed: Amount = local
            .iter()
            .filter(|p| p.status == PayoutStatus::Completed)
            .map(|p| p.amount)
            .sum();
        let remote_succeeded: Amount = remote
            .iter()
            .filter(|t| t.status == RemoteStatus::Succeeded)
            .map(|t| t.amount)
            .sum();
        let local_released = if fund.status == FundStatus::Released {
            fund.net_amount
        } else {
            0
        };
        let unknown_references = missing_references(&local, |r| {
            remote.iter().any(|t| t.reference == r)
        });

        if local_completed == remote_succeeded
            && local_released == remote_succeeded
            && unknown_references.is_empty()
        {
            return Ok(None);
        }
        Ok(Some(Finding {
            kind: DiscrepancyKind::TransferStatus,
            local: json!({
                "status": fund.status,
                "net_amount": fund.net_amount,
                "completed": local_completed,
                "unknown_references": unknown_references,
            }),
            remote: json!({ "succeeded": remote_succeeded, "transfers": remote }),
        }))
    }

    async fn check_refunds(
        &self,
        fund: &FundRecord,
        payouts: &[PayoutRecord],
    ) -> Result<Option<Finding>, ReconcileError> {
        let local: Vec<&PayoutRecord> = attempts_of(payouts, PayoutKind::Refund).collect();
        if local.is_empty() && fund.status != FundStatus::Refunded {
            return Ok(None);
        }
        let Some(reference) = fund.payment_reference.as_deref() else {
            return Ok(None);
        };
        let remote = self.processor.list_refunds(reference).await?;

        let local_refunded = fund.refund_amount.unwrap_or(0);
        let remote_succeeded: Amount = remote
            .iter()
            .filter(|r| r.status == RemoteStatus::Succeeded)
            .map(|r| r.amount)
            .sum();
        let unknown_references = missing_references(&local, |r| {
            remote.iter().any(|x| x.reference == r)
        });

        if local_refunded == remote_succeeded && unknown_references.is_empty() {
            return Ok(None);
        }
        Ok(Some(Finding {
            kind: DiscrepancyKind::RefundStatus,
            local: json!({
                "status": fund.status,
                "refund_amount": fund.refund_amount,
                "unknown_references": unknown_references,
            }),
            remote: json!({ "succeeded": remote_succeeded, "refunds": remote }),
        }))
    }

    fn check_exhausted(&self, fund: &FundRecord, payouts: &[PayoutRecord]) -> Option<Finding> {
        let kind = fund.in_flight()?;
        let attempts: Vec<&PayoutRecord> = attempts_of(payouts, kind).collect();
        let spent = attempts.len() as u32 >= self.max_attempts
            && attempts.iter().all(|p| p.status == PayoutStatus::Failed);
        if !fund.flagged && !spent {
            return None;
        }
        Some(Finding {
            kind: DiscrepancyKind::PayoutExhausted,
            local: json!({
                "kind": kind,
                "flagged": fund.flagged,
                "failed_attempts": fund.failed_attempts,
                "attempts": attempts.len(),
                "last_error": attempts.last().and_then(|p| p.last_error.clone()),
            }),
            remote: Value::Null,
        })
    }
}

/// In-flight movement that neither recovery nor a webhook will ever advance
fn check_stalled(fund: &FundRecord, payouts: &[PayoutRecord]) -> Option<Finding> {
    let reason = stall_reason(fund, payouts)?;
    let kind = fund.in_flight()?;
    let attempts: Vec<&PayoutRecord> = attempts_of(payouts, kind).collect();
    Some(Finding {
        kind: DiscrepancyKind::DispatchStalled,
        local: json!({
            "kind": kind,
            "reason": reason,
            "recipient_id": fund.recipient_id,
            "payment_reference": fund.payment_reference,
            "failed_attempts": fund.failed_attempts,
            "attempts": attempts.len(),
        }),
        remote: Value::Null,
    })
}

/// Processor references of local attempts that the processor does not list
fn missing_references(local: &[&PayoutRecord], known: impl Fn(&str) -> bool) -> Vec<String> {
    local
        .iter()
        .filter(|p| p.status != PayoutStatus::Failed)
        .filter_map(|p| p.transfer_reference.as_deref())
        .filter(|r| !known(r))
        .map(str::to_string)
        .collect()
}

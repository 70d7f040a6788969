//! Ledger storage
//!
//! `LedgerStore` is the durable home of fund records, the idempotency ledger,
//! the transaction audit log, payout attempts and reconciliation findings.
//! Transitions go through a [`LedgerTx`]: claim the event id, lock the fund
//! row, write the versioned update and the audit entry, then commit or roll
//! back as a unit.
//!
//! Accepted webhook events also live here, in the inbox, until ingestion
//! has a final answer for them.
//!
//! Two implementations: [`PgLedgerStore`] (PostgreSQL via sqlx) and
//! [`MemoryLedgerStore`] (development and tests).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StoreError;
use super::state::{DiscrepancyKind, InboxStatus, PayoutKind, PayoutStatus};
use super::types::{
    FundRecord, FundRecordId, InboundEvent, PaymentEvent, PayoutRecord,
    ReconciliationDiscrepancy, TransactionRecord,
};
use crate::money::Amount;

pub mod memory;
pub mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

/// One ingestion unit of work
#[async_trait]
pub trait LedgerTx: Send {
    /// Insert the event id into the idempotency ledger.
    ///
    /// Returns false when the id was already processed.
    async fn claim_event(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Insert a pending record unless the bounty already has one
    async fn insert_fund_if_absent(&mut self, record: &FundRecord) -> Result<(), StoreError>;

    /// Load and lock the bounty's fund record until commit/rollback
    async fn lock_fund(&mut self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError>;

    /// Write `record` if the stored version still equals `expected_version`
    async fn update_fund(
        &mut self,
        record: &FundRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError>;

    async fn append_transaction(&mut self, entry: &TransactionRecord) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Insert `record` unless its bounty is already funded; returns the stored record
    async fn open_fund(&self, record: &FundRecord) -> Result<FundRecord, StoreError>;

    async fn fund(&self, id: FundRecordId) -> Result<Option<FundRecord>, StoreError>;

    async fn fund_by_bounty(&self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError>;

    /// Non-terminal records last updated before `older_than`, plus flagged records
    async fn funds_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FundRecord>, StoreError>;

    async fn funds_for_recipient(&self, user_id: &str) -> Result<Vec<FundRecord>, StoreError>;

    async fn is_processed(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Audit entries where the user is the party, newest first
    async fn transactions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    async fn transactions_for_bounty(
        &self,
        bounty_id: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError>;

    /// Sum of committed `payment_intent` entries for the payer
    async fn captured_by_payer(&self, payer_id: &str) -> Result<Amount, StoreError>;

    async fn insert_payout(&self, payout: &PayoutRecord) -> Result<(), StoreError>;

    /// CAS update: only applies while the stored status equals `expected`
    async fn update_payout(
        &self,
        payout: &PayoutRecord,
        expected: PayoutStatus,
    ) -> Result<bool, StoreError>;

    /// Attempts for one fund, ordered by kind then attempt number
    async fn payouts_for_fund(&self, fund_id: FundRecordId)
    -> Result<Vec<PayoutRecord>, StoreError>;

    /// Attempts addressed to the user, newest first
    async fn payouts_for_recipient(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PayoutRecord>, StoreError>;

    async fn insert_discrepancy(
        &self,
        discrepancy: &ReconciliationDiscrepancy,
    ) -> Result<(), StoreError>;

    async fn discrepancies_for_fund(
        &self,
        fund_id: FundRecordId,
    ) -> Result<Vec<ReconciliationDiscrepancy>, StoreError>;

    /// Record an accepted event. Returns false if the id is already there.
    async fn inbox_put(&self, entry: &InboundEvent) -> Result<bool, StoreError>;

    /// Drop an event the ledger has a final answer for
    async fn inbox_remove(&self, event_id: &str) -> Result<(), StoreError>;

    /// Mark an event parked, inserting it if absent, and count the attempt
    async fn inbox_park(
        &self,
        event: &PaymentEvent,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Entries of any status untouched since `older_than`, oldest first
    async fn inbox_due(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError>;

    /// Entries with `status`, oldest first
    async fn inbox_entries(
        &self,
        status: InboxStatus,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError>;
}

/// Attempts of `kind` among a fund's payouts
pub fn attempts_of(payouts: &[PayoutRecord], kind: PayoutKind) -> impl Iterator<Item = &PayoutRecord> {
    payouts.iter().filter(move |p| p.kind == kind)
}

/// True if a discrepancy of `kind` is already on file
pub fn has_discrepancy(existing: &[ReconciliationDiscrepancy], kind: DiscrepancyKind) -> bool {
    existing.iter().any(|d| d.kind == kind)
}

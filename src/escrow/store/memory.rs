//! In-memory ledger store
//!
//! Same contract as the PostgreSQL store. A per-bounty `tokio::sync::Mutex`
//! stands in for `SELECT ... FOR UPDATE`; transaction writes are staged and
//! applied atomically on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

use super::{LedgerStore, LedgerTx};
use crate::escrow::error::StoreError;
use crate::escrow::state::{InboxStatus, PayoutStatus, TransactionType};
use crate::escrow::types::{
    BountyId, FundRecord, FundRecordId, InboundEvent, PaymentEvent, PayoutRecord,
    ReconciliationDiscrepancy, TransactionRecord,
};
use crate::money::Amount;

#[derive(Default)]
struct MemoryState {
    funds: HashMap<FundRecordId, FundRecord>,
    by_bounty: HashMap<BountyId, FundRecordId>,
    processed: HashMap<String, DateTime<Utc>>,
    /// Event ids claimed by transactions that have not finished
    claims_in_flight: HashSet<String>,
    transactions: Vec<TransactionRecord>,
    payouts: Vec<PayoutRecord>,
    discrepancies: Vec<ReconciliationDiscrepancy>,
    inbox: HashMap<String, InboundEvent>,
}

impl MemoryState {
    fn fund_by_bounty(&self, bounty_id: &str) -> Option<&FundRecord> {
        self.by_bounty
            .get(bounty_id)
            .and_then(|id| self.funds.get(id))
    }

    fn inbox_where(&self, limit: usize, keep: impl Fn(&InboundEvent) -> bool) -> Vec<InboundEvent> {
        let mut entries: Vec<InboundEvent> = self.inbox.values().filter(|e| keep(e)).cloned().collect();
        entries.sort_by(|a, b| a.received_at.cmp(&b.received_at).then(a.event.id.cmp(&b.event.id)));
        entries.truncate(limit);
        entries
    }
}

type RowLocks = DashMap<BountyId, Arc<tokio::sync::Mutex<()>>>;

#[derive(Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<RowLocks>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.state)
    }

    /// Number of processed event ids
    pub fn processed_count(&self) -> usize {
        self.state().processed.len()
    }
}

fn lock_state(state: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn lock_row(row_locks: &RowLocks, bounty_id: &str) -> OwnedMutexGuard<()> {
    let lock = row_locks
        .entry(bounty_id.to_string())
        .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
        .clone();
    lock.lock_owned().await
}

pub struct MemoryLedgerTx {
    state: Arc<Mutex<MemoryState>>,
    row_locks: Arc<RowLocks>,
    guards: HashMap<BountyId, OwnedMutexGuard<()>>,
    claimed: Vec<(String, DateTime<Utc>)>,
    new_funds: Vec<FundRecord>,
    updates: Vec<(FundRecord, i64)>,
    entries: Vec<TransactionRecord>,
    finished: bool,
}

impl MemoryLedgerTx {
    async fn acquire(&mut self, bounty_id: &str) {
        if !self.guards.contains_key(bounty_id) {
            let guard = lock_row(&self.row_locks, bounty_id).await;
            self.guards.insert(bounty_id.to_string(), guard);
        }
    }

    /// Record as this transaction sees it: staged writes over committed state
    fn visible_fund(&self, bounty_id: &str) -> Option<FundRecord> {
        if let Some((record, _)) = self.updates.iter().rev().find(|(r, _)| r.bounty_id == bounty_id) {
            return Some(record.clone());
        }
        if let Some(record) = self.new_funds.iter().find(|r| r.bounty_id == bounty_id) {
            return Some(record.clone());
        }
        lock_state(&self.state).fund_by_bounty(bounty_id).cloned()
    }

    fn release_claims(&mut self) {
        if self.claimed.is_empty() {
            return;
        }
        let mut state = lock_state(&self.state);
        for (event_id, _) in self.claimed.drain(..) {
            state.claims_in_flight.remove(&event_id);
        }
    }
}

impl Drop for MemoryLedgerTx {
    fn drop(&mut self) {
        if !self.finished {
            self.release_claims();
        }
    }
}

#[async_trait]
impl LedgerTx for MemoryLedgerTx {
    async fn claim_event(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut state = lock_state(&self.state);
        if state.processed.contains_key(event_id) {
            return Ok(false);
        }
        if !state.claims_in_flight.insert(event_id.to_string()) {
            return Err(StoreError::Contention(format!(
                "event {} is being processed",
                event_id
            )));
        }
        drop(state);
        self.claimed.push((event_id.to_string(), at));
        Ok(true)
    }

    async fn insert_fund_if_absent(&mut self, record: &FundRecord) -> Result<(), StoreError> {
        self.acquire(&record.bounty_id).await;
        if self.visible_fund(&record.bounty_id).is_none() {
            self.new_funds.push(record.clone());
        }
        Ok(())
    }

    async fn lock_fund(&mut self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError> {
        self.acquire(bounty_id).await;
        Ok(self.visible_fund(bounty_id))
    }

    async fn update_fund(
        &mut self,
        record: &FundRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        match self.visible_fund(&record.bounty_id) {
            Some(current) if current.id == record.id && current.version == expected_version => {
                self.updates.push((record.clone(), expected_version));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_transaction(&mut self, entry: &TransactionRecord) -> Result<(), StoreError> {
        self.entries.push(entry.clone());
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let mut state = lock_state(&self.state);

        // Validate everything before touching state so commit is all-or-nothing
        let mut checked = HashSet::new();
        for (record, expected) in &self.updates {
            // Later updates build on earlier ones from this transaction
            if !checked.insert(record.id) {
                continue;
            }
            let base_ok = match state.funds.get(&record.id) {
                Some(committed) => committed.version == *expected,
                None => self.new_funds.iter().any(|r| r.id == record.id),
            };
            if !base_ok {
                return Err(StoreError::VersionConflict(record.id.to_string()));
            }
        }
        for entry in &self.entries {
            if state.transactions.iter().any(|t| t.event_id == entry.event_id) {
                return Err(StoreError::Database(format!(
                    "duplicate transaction for event {}",
                    entry.event_id
                )));
            }
        }

        for record in self.new_funds.drain(..) {
            if !state.by_bounty.contains_key(&record.bounty_id) {
                state.by_bounty.insert(record.bounty_id.clone(), record.id);
                state.funds.insert(record.id, record);
            }
        }
        for (record, _) in self.updates.drain(..) {
            state.funds.insert(record.id, record);
        }
        state.transactions.append(&mut self.entries);
        for (event_id, at) in self.claimed.drain(..) {
            state.claims_in_flight.remove(&event_id);
            state.processed.insert(event_id, at);
        }
        drop(state);

        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StoreError> {
        self.release_claims();
        self.finished = true;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        Ok(Box::new(MemoryLedgerTx {
            state: self.state.clone(),
            row_locks: self.row_locks.clone(),
            guards: HashMap::new(),
            claimed: Vec::new(),
            new_funds: Vec::new(),
            updates: Vec::new(),
            entries: Vec::new(),
            finished: false,
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn open_fund(&self, record: &FundRecord) -> Result<FundRecord, StoreError> {
        let _row = lock_row(&self.row_locks, &record.bounty_id).await;
        let mut state = self.state();
        if let Some(existing) = state.fund_by_bounty(&record.bounty_id) {
            return Ok(existing.clone());
        }
        state
            .by_bounty
            .insert(record.bounty_id.clone(), record.id);
        state.funds.insert(record.id, record.clone());
        Ok(record.clone())
    }

    async fn fund(&self, id: FundRecordId) -> Result<Option<FundRecord>, StoreError> {
        Ok(self.state().funds.get(&id).cloned())
    }

    async fn fund_by_bounty(&self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError> {
        Ok(self.state().fund_by_bounty(bounty_id).cloned())
    }

    async fn funds_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FundRecord>, StoreError> {
        let state = self.state();
        let mut funds: Vec<FundRecord> = state
            .funds
            .values()
            .filter(|f| (!f.status.is_terminal() && f.updated_at < older_than) || f.flagged)
            .cloned()
            .collect();
        funds.sort_by_key(|f| f.updated_at);
        funds.truncate(limit);
        Ok(funds)
    }

    async fn funds_for_recipient(&self, user_id: &str) -> Result<Vec<FundRecord>, StoreError> {
        let state = self.state();
        let mut funds: Vec<FundRecord> = state
            .funds
            .values()
            .filter(|f| f.recipient_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        funds.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(funds)
    }

    async fn is_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.state().processed.contains_key(event_id))
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.state();
        let mut entries: Vec<TransactionRecord> = state
            .transactions
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn transactions_for_bounty(
        &self,
        bounty_id: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let state = self.state();
        let mut entries: Vec<TransactionRecord> = state
            .transactions
            .iter()
            .filter(|t| t.bounty_id == bounty_id)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(entries)
    }

    async fn captured_by_payer(&self, payer_id: &str) -> Result<Amount, StoreError> {
        Ok(self
            .state()
            .transactions
            .iter()
            .filter(|t| t.user_id == payer_id && t.tx_type == TransactionType::PaymentIntent)
            .fold(0, |total: Amount, t| total.saturating_add(t.amount)))
    }

    async fn insert_payout(&self, payout: &PayoutRecord) -> Result<(), StoreError> {
        let mut state = self.state();
        let taken = state.payouts.iter().any(|p| {
            p.fund_record_id == payout.fund_record_id
                && p.kind == payout.kind
                && p.attempt == payout.attempt
        });
        if taken {
            return Err(StoreError::Database(format!(
                "duplicate {} attempt {} for fund {}",
                payout.kind, payout.attempt, payout.fund_record_id
            )));
        }
        state.payouts.push(payout.clone());
        Ok(())
    }

    async fn update_payout(
        &self,
        payout: &PayoutRecord,
        expected: PayoutStatus,
    ) -> Result<bool, StoreError> {
        let mut state = self.state();
        match state.payouts.iter_mut().find(|p| p.id == payout.id) {
            Some(stored) if stored.status == expected => {
                stored.status = payout.status;
                stored.transfer_reference = payout.transfer_reference.clone();
                stored.last_error = payout.last_error.clone();
                stored.updated_at = payout.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn payouts_for_fund(
        &self,
        fund_id: FundRecordId,
    ) -> Result<Vec<PayoutRecord>, StoreError> {
        let state = self.state();
        let mut payouts: Vec<PayoutRecord> = state
            .payouts
            .iter()
            .filter(|p| p.fund_record_id == fund_id)
            .cloned()
            .collect();
        payouts.sort_by_key(|p| (p.kind.id(), p.attempt));
        Ok(payouts)
    }

    async fn payouts_for_recipient(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PayoutRecord>, StoreError> {
        let state = self.state();
        let mut payouts: Vec<PayoutRecord> = state
            .payouts
            .iter()
            .filter(|p| p.recipient_id == user_id)
            .cloned()
            .collect();
        payouts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        payouts.truncate(limit);
        Ok(payouts)
    }

    async fn insert_discrepancy(
        &self,
        discrepancy: &ReconciliationDiscrepancy,
    ) -> Result<(), StoreError> {
        self.state().discrepancies.push(discrepancy.clone());
        Ok(())
    }

    async fn discrepancies_for_fund(
        &self,
        fund_id: FundRecordId,
    ) -> Result<Vec<ReconciliationDiscrepancy>, StoreError> {
        Ok(self
            .state()
            .discrepancies
            .iter()
            .filter(|d| d.fund_record_id == fund_id)
            .cloned()
            .collect())
    }

    async fn inbox_put(&self, entry: &InboundEvent) -> Result<bool, StoreError> {
        let mut state = self.state();
        if state.inbox.contains_key(&entry.event.id) {
            return Ok(false);
        }
        state.inbox.insert(entry.event.id.clone(), entry.clone());
        Ok(true)
    }

    async fn inbox_remove(&self, event_id: &str) -> Result<(), StoreError> {
        self.state().inbox.remove(event_id);
        Ok(())
    }

    async fn inbox_park(
        &self,
        event: &PaymentEvent,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state();
        let entry = state
            .inbox
            .entry(event.id.clone())
            .or_insert_with(|| InboundEvent::queued(event.clone(), at));
        entry.status = InboxStatus::Parked;
        entry.attempts += 1;
        entry.last_error = Some(reason.to_string());
        entry.updated_at = at;
        Ok(())
    }

    async fn inbox_due(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError> {
        Ok(self.state().inbox_where(limit, |e| e.updated_at < older_than))
    }

    async fn inbox_entries(
        &self,
        status: InboxStatus,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError> {
        Ok(self.state().inbox_where(limit, |e| e.status == status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::state::{FundStatus, PayoutKind};
    use crate::escrow::types::{EventKind, TransactionId};
    use std::time::Duration;

    fn record(bounty: &str) -> FundRecord {
        FundRecord::new_pending(bounty, "alice", 10_000, "usd", None, None, Utc::now())
    }

    fn entry(fund: &FundRecord, event_id: &str) -> TransactionRecord {
        TransactionRecord {
            id: TransactionId::new(),
            bounty_id: fund.bounty_id.clone(),
            fund_record_id: fund.id,
            user_id: fund.payer_id.clone(),
            tx_type: TransactionType::PaymentIntent,
            amount: fund.amount,
            currency: fund.currency.clone(),
            processor_reference: None,
            event_id: event_id.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_applies_all_writes() {
        let store = MemoryLedgerStore::new();
        let fund = record("b1");

        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_event("e1", Utc::now()).await.unwrap());
        tx.insert_fund_if_absent(&fund).await.unwrap();
        let mut locked = tx.lock_fund("b1").await.unwrap().unwrap();
        locked.status = FundStatus::Held;
        locked.version = 1;
        assert!(tx.update_fund(&locked, 0).await.unwrap());
        tx.append_transaction(&entry(&fund, "e1")).await.unwrap();

        // Nothing visible before commit
        assert!(store.fund_by_bounty("b1").await.unwrap().is_none());
        tx.commit().await.unwrap();

        let stored = store.fund_by_bounty("b1").await.unwrap().unwrap();
        assert_eq!(stored.status, FundStatus::Held);
        assert_eq!(stored.version, 1);
        assert!(store.is_processed("e1").await.unwrap());
        assert_eq!(store.transactions_for_bounty("b1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_claim_and_writes() {
        let store = MemoryLedgerStore::new();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_event("e1", Utc::now()).await.unwrap());
        tx.insert_fund_if_absent(&record("b1")).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(!store.is_processed("e1").await.unwrap());
        assert!(store.fund_by_bounty("b1").await.unwrap().is_none());

        // Claim is free again
        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_event("e1", Utc::now()).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.claim_event("e1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_tx_releases_claim() {
        let store = MemoryLedgerStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            assert!(tx.claim_event("e1", Utc::now()).await.unwrap());
        }
        let mut tx = store.begin().await.unwrap();
        assert!(tx.claim_event("e1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_claim_is_contention() {
        let store = MemoryLedgerStore::new();
        let mut first = store.begin().await.unwrap();
        assert!(first.claim_event("e1", Utc::now()).await.unwrap());

        let mut second = store.begin().await.unwrap();
        assert!(matches!(
            second.claim_event("e1", Utc::now()).await,
            Err(StoreError::Contention(_))
        ));
        first.commit().await.unwrap();
        assert!(!second.claim_event("e1", Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_version_guard() {
        let store = MemoryLedgerStore::new();
        store.open_fund(&record("b1")).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut locked = tx.lock_fund("b1").await.unwrap().unwrap();
        locked.version = 1;
        assert!(!tx.update_fund(&locked, 5).await.unwrap());
        assert!(tx.update_fund(&locked, 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_row_lock_serializes_same_bounty() {
        let store = MemoryLedgerStore::new();
        store.open_fund(&record("b1")).await.unwrap();

        let mut first = store.begin().await.unwrap();
        first.lock_fund("b1").await.unwrap();

        let store2 = store.clone();
        let waiter = tokio::spawn(async move {
            let mut second = store2.begin().await.unwrap();
            second.lock_fund("b1").await.unwrap().map(|f| f.version)
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        first.rollback().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_open_fund_is_idempotent_per_bounty() {
        let store = MemoryLedgerStore::new();
        let first = store.open_fund(&record("b1")).await.unwrap();
        let second = store.open_fund(&record("b1")).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_payout_cas_and_unique_attempt() {
        let store = MemoryLedgerStore::new();
        let fund = store.open_fund(&record("b1")).await.unwrap();
        let mut payout = PayoutRecord::new(&fund, PayoutKind::Transfer, "bob".into(), 9_000, 1);
        store.insert_payout(&payout).await.unwrap();

        let dup = PayoutRecord::new(&fund, PayoutKind::Transfer, "bob".into(), 9_000, 1);
        assert!(store.insert_payout(&dup).await.is_err());

        payout.status = PayoutStatus::Processing;
        assert!(store.update_payout(&payout, PayoutStatus::Pending).await.unwrap());
        assert!(!store.update_payout(&payout, PayoutStatus::Pending).await.unwrap());

        let stored = store.payouts_for_fund(fund.id).await.unwrap();
        assert_eq!(stored[0].status, PayoutStatus::Processing);
    }

    #[tokio::test]
    async fn test_inbox_park_and_remove() {
        let store = MemoryLedgerStore::new();
        let at = Utc::now() - chrono::Duration::minutes(5);
        let event = PaymentEvent::new("e1", "b1", EventKind::BountyCompleted, 0, "usd");

        assert!(store.inbox_put(&InboundEvent::queued(event.clone(), at)).await.unwrap());
        assert!(!store.inbox_put(&InboundEvent::queued(event.clone(), at)).await.unwrap());
        assert_eq!(store.inbox_due(Utc::now(), 10).await.unwrap().len(), 1);
        assert!(store.inbox_due(at, 10).await.unwrap().is_empty());

        store.inbox_park(&event, "no fund record", Utc::now()).await.unwrap();
        let parked = store.inbox_entries(InboxStatus::Parked, 10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].attempts, 1);
        assert_eq!(parked[0].received_at, at);
        assert_eq!(parked[0].last_error.as_deref(), Some("no fund record"));

        // Parking an event that never went through the inbox keeps it too
        let other = PaymentEvent::new("e2", "b1", EventKind::TransferFailed, 0, "usd");
        store.inbox_park(&other, "unknown tier", Utc::now()).await.unwrap();
        assert_eq!(store.inbox_entries(InboxStatus::Parked, 10).await.unwrap().len(), 2);

        store.inbox_remove("e1").await.unwrap();
        store.inbox_remove("e2").await.unwrap();
        assert!(store.inbox_entries(InboxStatus::Parked, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_captured_by_payer_sums_captures_only() {
        let store = MemoryLedgerStore::new();
        let fund = record("b1");
        let mut tx = store.begin().await.unwrap();
        tx.append_transaction(&entry(&fund, "e1")).await.unwrap();
        let mut refund = entry(&fund, "e2");
        refund.tx_type = TransactionType::Refund;
        tx.append_transaction(&refund).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.captured_by_payer("alice").await.unwrap(), 10_000);
        assert_eq!(store.captured_by_payer("bob").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconciliation_candidates() {
        let store = MemoryLedgerStore::new();
        let mut old = record("old");
        old.updated_at = Utc::now() - chrono::Duration::hours(2);
        store.open_fund(&old).await.unwrap();
        store.open_fund(&record("fresh")).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let due = store.funds_for_reconciliation(cutoff, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].bounty_id, "old");
    }
}

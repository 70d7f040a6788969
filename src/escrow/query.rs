//! Read-only views for the UI layer
//!
//! Everything here is derived from fund records, payout attempts and the
//! audit log on each call; nothing is stored separately.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::error::StoreError;
use super::state::{FundStatus, PayoutKind, TransactionType};
use super::store::LedgerStore;
use super::types::{PayoutRecord, TransactionRecord};
use crate::money::Amount;

/// Default page size for history listings
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Per-currency balance of a recipient
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub currency: String,
    /// Net amounts of released funds
    pub released: Amount,
    /// Already paid out to the user's bank
    pub disbursed: Amount,
    /// Net amounts of held funds with a transfer to the user in flight
    pub processing: Amount,
    pub available: Amount,
}

/// State of a fund as end users may see it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibleStatus {
    /// Pending or held, flagged or not
    Processing,
    Released,
    Refunded,
}

impl From<FundStatus> for VisibleStatus {
    fn from(status: FundStatus) -> Self {
        match status {
            FundStatus::Pending | FundStatus::Held => VisibleStatus::Processing,
            FundStatus::Released => VisibleStatus::Released,
            FundStatus::Refunded => VisibleStatus::Refunded,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundView {
    pub bounty_id: String,
    pub status: VisibleStatus,
    pub currency: String,
    /// Only present once released
    pub net_amount: Option<Amount>,
    /// Only present once refunded
    pub refund_amount: Option<Amount>,
}

pub struct LedgerQueries {
    store: Arc<dyn LedgerStore>,
}

impl LedgerQueries {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Balances of `user_id` as a recipient, one entry per currency
    pub async fn balance(&self, user_id: &str) -> Result<Vec<Balance>, StoreError> {
        let mut balances: BTreeMap<String, Balance> = BTreeMap::new();

        for fund in self.store.funds_for_recipient(user_id).await? {
            let entry = balances
                .entry(fund.currency.clone())
                .or_insert_with(|| Balance {
                    currency: fund.currency.clone(),
                    ..Balance::default()
                });
            match fund.status {
                FundStatus::Released => entry.released += fund.net_amount,
                FundStatus::Held if fund.in_flight() == Some(PayoutKind::Transfer) => {
                    entry.processing += fund.net_amount
                }
                _ => {}
            }
        }

        for tx in self.store.transactions_for_user(user_id, usize::MAX).await? {
            if tx.tx_type != TransactionType::Payout {
                continue;
            }
            let entry = balances
                .entry(tx.currency.clone())
                .or_insert_with(|| Balance {
                    currency: tx.currency.clone(),
                    ..Balance::default()
                });
            entry.disbursed += tx.amount;
        }

        Ok(balances
            .into_values()
            .map(|mut b| {
                b.available = b.released.saturating_sub(b.disbursed);
                b
            })
            .collect())
    }

    /// Payout attempts addressed to the user, newest first
    pub async fn payout_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PayoutRecord>, StoreError> {
        self.store.payouts_for_recipient(user_id, limit).await
    }

    /// Audit entries where the user is the party, newest first
    pub async fn activity(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        self.store.transactions_for_user(user_id, limit).await
    }

    pub async fn fund_view(&self, bounty_id: &str) -> Result<Option<FundView>, StoreError> {
        let Some(fund) = self.store.fund_by_bounty(bounty_id).await? else {
            return Ok(None);
        };
        let status = VisibleStatus::from(fund.status);
        Ok(Some(FundView {
            bounty_id: fund.bounty_id,
            status,
            currency: fund.currency,
            net_amount: (status == VisibleStatus::Released).then_some(fund.net_amount),
            refund_amount: if status == VisibleStatus::Refunded {
                fund.refund_amount
            } else {
                None
            },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escrow::store::{LedgerTx, MemoryLedgerStore};
    use crate::escrow::types::{FundRecord, PendingAction, TransactionId};
    use chrono::Utc;

    fn fund(bounty: &str, status: FundStatus, net: Amount) -> FundRecord {
        let mut f = FundRecord::new_pending(bounty, "alice", net + 100, "usd", None, None, Utc::now());
        f.status = status;
        f.platform_fee_amount = 100;
        f.net_amount = net;
        f.recipient_id = Some("bob".to_string());
        f
    }

    async fn record_payout(store: &MemoryLedgerStore, user: &str, amount: Amount) {
        let f = store.fund_by_bounty("b1").await.unwrap().unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.append_transaction(&TransactionRecord {
            id: TransactionId::new(),
            bounty_id: f.bounty_id.clone(),
            fund_record_id: f.id,
            user_id: user.to_string(),
            tx_type: TransactionType::Payout,
            amount,
            currency: "usd".to_string(),
            processor_reference: Some("po_1".to_string()),
            event_id: "po_evt_1".to_string(),
            created_at: Utc::now(),
        })
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_balance_derivation() {
        let store = Arc::new(MemoryLedgerStore::new());
        store.open_fund(&fund("b1", FundStatus::Released, 9_000)).await.unwrap();
        store.open_fund(&fund("b2", FundStatus::Released, 4_500)).await.unwrap();
        let mut in_flight = fund("b3", FundStatus::Held, 2_000);
        in_flight.pending_action = Some(PendingAction::Transfer);
        store.open_fund(&in_flight).await.unwrap();
        // Held without a transfer: not counted anywhere
        store.open_fund(&fund("b4", FundStatus::Held, 7_000)).await.unwrap();
        record_payout(&store, "bob", 5_000).await;

        let queries = LedgerQueries::new(store);
        let balances = queries.balance("bob").await.unwrap();
        assert_eq!(
            balances,
            vec![Balance {
                currency: "usd".to_string(),
                released: 13_500,
                disbursed: 5_000,
                processing: 2_000,
                available: 8_500,
            }]
        );
        assert!(queries.balance("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fund_view_hides_internal_states() {
        let store = Arc::new(MemoryLedgerStore::new());
        let mut flagged = fund("b1", FundStatus::Held, 9_000);
        flagged.flagged = true;
        store.open_fund(&flagged).await.unwrap();
        let mut refunded = fund("b2", FundStatus::Refunded, 9_000);
        refunded.refund_amount = Some(9_100);
        store.open_fund(&refunded).await.unwrap();
        store.open_fund(&fund("b3", FundStatus::Released, 9_000)).await.unwrap();

        let queries = LedgerQueries::new(store);
        let held = queries.fund_view("b1").await.unwrap().unwrap();
        assert_eq!(held.status, VisibleStatus::Processing);
        assert_eq!(held.net_amount, None);

        let refunded = queries.fund_view("b2").await.unwrap().unwrap();
        assert_eq!(refunded.status, VisibleStatus::Refunded);
        assert_eq!(refunded.refund_amount, Some(9_100));
        assert_eq!(refunded.net_amount, None);

        let released = queries.fund_view("b3").await.unwrap().unwrap();
        assert_eq!(released.net_amount, Some(9_000));

        assert!(queries.fund_view("missing").await.unwrap().is_none());
    }

    #[test]
    fn test_visible_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&VisibleStatus::Processing).unwrap(),
            "\"processing\""
        );
    }
}

//! PostgreSQL ledger store
//!
//! Row locks come from `SELECT ... FOR UPDATE` inside the ingestion
//! transaction; every fund update is additionally guarded by
//! `WHERE version = expected`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{LedgerStore, LedgerTx};
use crate::escrow::error::StoreError;
use crate::escrow::state::{
    DiscrepancyKind, FundStatus, InboxStatus, PayoutKind, PayoutStatus, TransactionType,
};
use crate::escrow::types::{
    FundRecord, FundRecordId, InboundEvent, PaymentEvent, PayoutRecord, PendingAction,
    ReconciliationDiscrepancy, TransactionRecord,
};
use crate::money::Amount;

const FUND_COLUMNS: &str = r#"
    id, bounty_id, payer_id, payment_reference, transfer_group, amount, currency,
    platform_fee_amount, net_amount, status, refund_amount, refund_reason,
    recipient_id, pending_kind, pending_amount, pending_reason,
    failed_attempts, flagged, version, created_at, updated_at
"#;

const PAYOUT_COLUMNS: &str = r#"
    id, fund_record_id, bounty_id, kind, recipient_id, amount, currency, attempt,
    status, transfer_reference, last_error, created_at, updated_at
"#;

const TRANSACTION_COLUMNS: &str = r#"
    id, bounty_id, fund_record_id, user_id, tx_type, amount, currency,
    processor_reference, event_id, created_at
"#;

const INBOX_COLUMNS: &str = r#"
    event_id, body, status, attempts, last_error, received_at, updated_at
"#;

pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

pub struct PgLedgerTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTx for PgLedgerTx {
    async fn claim_event(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processed_at)
            VALUES ($1, $2)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_fund_if_absent(&mut self, record: &FundRecord) -> Result<(), StoreError> {
        insert_fund(record)?.execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn lock_fund(&mut self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM fund_records WHERE bounty_id = $1 FOR UPDATE",
            FUND_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(bounty_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(fund_from_row).transpose()
    }

    async fn update_fund(
        &mut self,
        record: &FundRecord,
        expected_version: i64,
    ) -> Result<bool, StoreError> {
        let (pending_kind, pending_amount, pending_reason) = encode_pending(&record.pending_action)?;
        let result = sqlx::query(
            r#"
            UPDATE fund_records
            SET payment_reference = $1, platform_fee_amount = $2, net_amount = $3,
                status = $4, refund_amount = $5, refund_reason = $6, recipient_id = $7,
                pending_kind = $8, pending_amount = $9, pending_reason = $10,
                failed_attempts = $11, flagged = $12, version = $13, updated_at = $14
            WHERE id = $15 AND version = $16
            "#,
        )
        .bind(&record.payment_reference)
        .bind(to_db(record.platform_fee_amount)?)
        .bind(to_db(record.net_amount)?)
        .bind(record.status.id())
        .bind(record.refund_amount.map(to_db).transpose()?)
        .bind(&record.refund_reason)
        .bind(&record.recipient_id)
        .bind(pending_kind)
        .bind(pending_amount)
        .bind(pending_reason)
        .bind(record.failed_attempts as i32)
        .bind(record.flagged)
        .bind(record.version)
        .bind(record.updated_at)
        .bind(record.id.to_string())
        .bind(expected_version)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn append_transaction(&mut self, entry: &TransactionRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transaction_records
                (id, bounty_id, fund_record_id, user_id, tx_type, amount, currency,
                 processor_reference, event_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(&entry.bounty_id)
        .bind(entry.fund_record_id.to_string())
        .bind(&entry.user_id)
        .bind(entry.tx_type.id())
        .bind(to_db(entry.amount)?)
        .bind(&entry.currency)
        .bind(&entry.processor_reference)
        .bind(&entry.event_id)
        .bind(entry.created_at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn begin(&self) -> Result<Box<dyn LedgerTx>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLedgerTx { tx }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn open_fund(&self, record: &FundRecord) -> Result<FundRecord, StoreError> {
        insert_fund(record)?.execute(&self.pool).await?;
        self.fund_by_bounty(&record.bounty_id)
            .await?
            .ok_or_else(|| StoreError::Corrupt(format!("fund for {} vanished", record.bounty_id)))
    }

    async fn fund(&self, id: FundRecordId) -> Result<Option<FundRecord>, StoreError> {
        let sql = format!("SELECT {} FROM fund_records WHERE id = $1", FUND_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fund_from_row).transpose()
    }

    async fn fund_by_bounty(&self, bounty_id: &str) -> Result<Option<FundRecord>, StoreError> {
        let sql = format!("SELECT {} FROM fund_records WHERE bounty_id = $1", FUND_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(bounty_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(fund_from_row).transpose()
    }

    async fn funds_for_reconciliation(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<FundRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM fund_records
            WHERE (status IN ($1, $2) AND updated_at < $3) OR flagged
            ORDER BY updated_at ASC
            LIMIT $4
            "#,
            FUND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(FundStatus::Pending.id())
            .bind(FundStatus::Held.id())
            .bind(older_than)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fund_from_row).collect()
    }

    async fn funds_for_recipient(&self, user_id: &str) -> Result<Vec<FundRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM fund_records WHERE recipient_id = $1 ORDER BY created_at DESC",
            FUND_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(fund_from_row).collect()
    }

    async fn is_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let found = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM processed_events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn transactions_for_user(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transaction_records WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn transactions_for_bounty(
        &self,
        bounty_id: &str,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM transaction_records WHERE bounty_id = $1 ORDER BY created_at ASC, id ASC",
            TRANSACTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(bounty_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn captured_by_payer(&self, payer_id: &str) -> Result<Amount, StoreError> {
        let total: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT SUM(amount)::BIGINT FROM transaction_records
            WHERE user_id = $1 AND tx_type = $2
            "#,
        )
        .bind(payer_id)
        .bind(TransactionType::PaymentIntent.id())
        .fetch_one(&self.pool)
        .await?;
        from_db(total.unwrap_or(0), "captured total")
    }

    async fn insert_payout(&self, payout: &PayoutRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payout_records
                (id, fund_record_id, bounty_id, kind, recipient_id, amount, currency,
                 attempt, status, transfer_reference, last_error, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(payout.id.to_string())
        .bind(payout.fund_record_id.to_string())
        .bind(&payout.bounty_id)
        .bind(payout.kind.id())
        .bind(&payout.recipient_id)
        .bind(to_db(payout.amount)?)
        .bind(&payout.currency)
        .bind(payout.attempt as i32)
        .bind(payout.status.id())
        .bind(&payout.transfer_reference)
        .bind(&payout.last_error)
        .bind(payout.created_at)
        .bind(payout.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_payout(
        &self,
        payout: &PayoutRecord,
        expected: PayoutStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payout_records
            SET status = $1, transfer_reference = $2, last_error = $3, updated_at = $4
            WHERE id = $5 AND status = $6
            "#,
        )
        .bind(payout.status.id())
        .bind(&payout.transfer_reference)
        .bind(&payout.last_error)
        .bind(payout.updated_at)
        .bind(payout.id.to_string())
        .bind(expected.id())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn payouts_for_fund(
        &self,
        fund_id: FundRecordId,
    ) -> Result<Vec<PayoutRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payout_records WHERE fund_record_id = $1 ORDER BY kind, attempt",
            PAYOUT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(fund_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payout_from_row).collect()
    }

    async fn payouts_for_recipient(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<PayoutRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM payout_records WHERE recipient_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
            PAYOUT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(payout_from_row).collect()
    }

    async fn insert_discrepancy(
        &self,
        discrepancy: &ReconciliationDiscrepancy,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_discrepancies
                (id, fund_record_id, bounty_id, kind, local_view, processor_view, detected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(discrepancy.id.to_string())
        .bind(discrepancy.fund_record_id.to_string())
        .bind(&discrepancy.bounty_id)
        .bind(discrepancy.kind.id())
        .bind(&discrepancy.local_view)
        .bind(&discrepancy.processor_view)
        .bind(discrepancy.detected_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn discrepancies_for_fund(
        &self,
        fund_id: FundRecordId,
    ) -> Result<Vec<ReconciliationDiscrepancy>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, fund_record_id, bounty_id, kind, local_view, processor_view, detected_at
            FROM reconciliation_discrepancies
            WHERE fund_record_id = $1
            ORDER BY detected_at ASC
            "#,
        )
        .bind(fund_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(discrepancy_from_row).collect()
    }

    async fn inbox_put(&self, entry: &InboundEvent) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO inbound_events
                (event_id, bounty_id, body, status, attempts, last_error, received_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&entry.event.id)
        .bind(&entry.event.bounty_id)
        .bind(encode_event(&entry.event)?)
        .bind(entry.status.id())
        .bind(entry.attempts as i32)
        .bind(&entry.last_error)
        .bind(entry.received_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn inbox_remove(&self, event_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM inbound_events WHERE event_id = $1")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn inbox_park(
        &self,
        event: &PaymentEvent,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO inbound_events
                (event_id, bounty_id, body, status, attempts, last_error, received_at, updated_at)
            VALUES ($1, $2, $3, $4, 1, $5, $6, $6)
            ON CONFLICT (event_id) DO UPDATE
            SET status = EXCLUDED.status,
                attempts = inbound_events.attempts + 1,
                last_error = EXCLUDED.last_error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&event.id)
        .bind(&event.bounty_id)
        .bind(encode_event(event)?)
        .bind(InboxStatus::Parked.id())
        .bind(reason)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn inbox_due(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM inbound_events WHERE updated_at < $1 ORDER BY received_at ASC, event_id ASC LIMIT $2",
            INBOX_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(inbound_from_row).collect()
    }

    async fn inbox_entries(
        &self,
        status: InboxStatus,
        limit: usize,
    ) -> Result<Vec<InboundEvent>, StoreError> {
        let sql = format!(
            "SELECT {} FROM inbound_events WHERE status = $1 ORDER BY received_at ASC, event_id ASC LIMIT $2",
            INBOX_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(status.id())
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(inbound_from_row).collect()
    }
}

fn insert_fund(
    record: &FundRecord,
) -> Result<sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>, StoreError> {
    // Fresh records carry no pending action and no refund yet
    Ok(sqlx::query(
        r#"
        INSERT INTO fund_records
            (id, bounty_id, payer_id, payment_reference, transfer_group, amount, currency,
             platform_fee_amount, net_amount, status, failed_attempts, flagged, version,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 0, FALSE, $11, $12, $13)
        ON CONFLICT (bounty_id) DO NOTHING
        "#,
    )
    .bind(record.id.to_string())
    .bind(&record.bounty_id)
    .bind(&record.payer_id)
    .bind(&record.payment_reference)
    .bind(&record.transfer_group)
    .bind(to_db(record.amount)?)
    .bind(&record.currency)
    .bind(to_db(record.platform_fee_amount)?)
    .bind(to_db(record.net_amount)?)
    .bind(record.status.id())
    .bind(record.version)
    .bind(record.created_at)
    .bind(record.updated_at))
}

fn to_db(amount: Amount) -> Result<i64, StoreError> {
    i64::try_from(amount).map_err(|_| StoreError::AmountOverflow(amount))
}

fn from_db(value: i64, column: &str) -> Result<Amount, StoreError> {
    Amount::try_from(value).map_err(|_| StoreError::Corrupt(format!("negative {}: {}", column, value)))
}

fn parse_id<T: std::str::FromStr>(row: &PgRow, column: &str) -> Result<T, StoreError> {
    let raw: String = row.try_get(column)?;
    raw.parse()
        .map_err(|_| StoreError::Corrupt(format!("invalid {}: {}", column, raw)))
}

fn encode_pending(
    action: &Option<PendingAction>,
) -> Result<(Option<i16>, Option<i64>, Option<String>), StoreError> {
    Ok(match action {
        None => (None, None, None),
        Some(PendingAction::Transfer) => (Some(PayoutKind::Transfer.id()), None, None),
        Some(PendingAction::Refund { amount, reason }) => (
            Some(PayoutKind::Refund.id()),
            Some(to_db(*amount)?),
            reason.clone(),
        ),
    })
}

fn decode_pending(row: &PgRow) -> Result<Option<PendingAction>, StoreError> {
    let kind: Option<i16> = row.try_get("pending_kind")?;
    let Some(kind_id) = kind else {
        return Ok(None);
    };
    match PayoutKind::from_id(kind_id) {
        Some(PayoutKind::Transfer) => Ok(Some(PendingAction::Transfer)),
        Some(PayoutKind::Refund) => {
            let amount: Option<i64> = row.try_get("pending_amount")?;
            let amount = amount
                .ok_or_else(|| StoreError::Corrupt("refund pending without amount".to_string()))?;
            Ok(Some(PendingAction::Refund {
                amount: from_db(amount, "pending_amount")?,
                reason: row.try_get("pending_reason")?,
            }))
        }
        None => Err(StoreError::Corrupt(format!("invalid pending_kind: {}", kind_id))),
    }
}

fn fund_from_row(row: &PgRow) -> Result<FundRecord, StoreError> {
    let status_id: i16 = row.try_get("status")?;
    let status = FundStatus::from_id(status_id)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid fund status: {}", status_id)))?;
    let refund_amount: Option<i64> = row.try_get("refund_amount")?;
    let failed_attempts: i32 = row.try_get("failed_attempts")?;

    Ok(FundRecord {
        id: parse_id(row, "id")?,
        bounty_id: row.try_get("bounty_id")?,
        payer_id: row.try_get("payer_id")?,
        payment_reference: row.try_get("payment_reference")?,
        transfer_group: row.try_get("transfer_group")?,
        amount: from_db(row.try_get("amount")?, "amount")?,
        currency: row.try_get("currency")?,
        platform_fee_amount: from_db(row.try_get("platform_fee_amount")?, "platform_fee_amount")?,
        net_amount: from_db(row.try_get("net_amount")?, "net_amount")?,
        status,
        refund_amount: refund_amount
            .map(|v| from_db(v, "refund_amount"))
            .transpose()?,
        refund_reason: row.try_get("refund_reason")?,
        recipient_id: row.try_get("recipient_id")?,
        pending_action: decode_pending(row)?,
        failed_attempts: failed_attempts.max(0) as u32,
        flagged: row.try_get("flagged")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn payout_from_row(row: &PgRow) -> Result<PayoutRecord, StoreError> {
    let kind_id: i16 = row.try_get("kind")?;
    let status_id: i16 = row.try_get("status")?;
    let attempt: i32 = row.try_get("attempt")?;

    Ok(PayoutRecord {
        id: parse_id(row, "id")?,
        fund_record_id: parse_id(row, "fund_record_id")?,
        bounty_id: row.try_get("bounty_id")?,
        kind: PayoutKind::from_id(kind_id)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid payout kind: {}", kind_id)))?,
        recipient_id: row.try_get("recipient_id")?,
        amount: from_db(row.try_get("amount")?, "amount")?,
        currency: row.try_get("currency")?,
        attempt: attempt.max(0) as u32,
        status: PayoutStatus::from_id(status_id)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid payout status: {}", status_id)))?,
        transfer_reference: row.try_get("transfer_reference")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn transaction_from_row(row: &PgRow) -> Result<TransactionRecord, StoreError> {
    let type_id: i16 = row.try_get("tx_type")?;

    Ok(TransactionRecord {
        id: parse_id(row, "id")?,
        bounty_id: row.try_get("bounty_id")?,
        fund_record_id: parse_id(row, "fund_record_id")?,
        user_id: row.try_get("user_id")?,
        tx_type: TransactionType::from_id(type_id)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid tx_type: {}", type_id)))?,
        amount: from_db(row.try_get("amount")?, "amount")?,
        currency: row.try_get("currency")?,
        processor_reference: row.try_get("processor_reference")?,
        event_id: row.try_get("event_id")?,
        created_at: row.try_get("created_at")?,
    })
}

fn discrepancy_from_row(row: &PgRow) -> Result<ReconciliationDiscrepancy, StoreError> {
    let kind_id: i16 = row.try_get("kind")?;

    Ok(ReconciliationDiscrepancy {
        id: parse_id(row, "id")?,
        fund_record_id: parse_id(row, "fund_record_id")?,
        bounty_id: row.try_get("bounty_id")?,
        kind: DiscrepancyKind::from_id(kind_id)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid discrepancy kind: {}", kind_id)))?,
        local_view: row.try_get("local_view")?,
        processor_view: row.try_get("processor_view")?,
        detected_at: row.try_get("detected_at")?,
    })
}

fn encode_event(event: &PaymentEvent) -> Result<String, StoreError> {
    serde_json::to_string(event)
        .map_err(|e| StoreError::Corrupt(format!("unencodable event {}: {}", event.id, e)))
}

fn inbound_from_row(row: &PgRow) -> Result<InboundEvent, StoreError> {
    let body: String = row.try_get("body")?;
    let event_id: String = row.try_get("event_id")?;
    let event: PaymentEvent = serde_json::from_str(&body)
        .map_err(|e| StoreError::Corrupt(format!("inbound event {}: {}", event_id, e)))?;
    let status_id: i16 = row.try_get("status")?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(InboundEvent {
        event,
        status: InboxStatus::from_id(status_id)
            .ok_or_else(|| StoreError::Corrupt(format!("invalid inbox status: {}", status_id)))?,
        attempts: attempts.max(0) as u32,
        last_error: row.try_get("last_error")?,
        received_at: row.try_get("received_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

//! Integration tests for the escrow engine
//!
//! Ingestion, dispatcher and sandbox processor wired together over the
//! in-memory store. Processor acknowledgements are fed back through the
//! engine the way the webhook endpoint would.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::DispatcherConfig;
use crate::escrow::dispatcher::PayoutDispatcher;
use crate::escrow::error::TransitionError;
use crate::escrow::ingest::{IngestResult, IngestionEngine};
use crate::escrow::notify::LogNotifier;
use crate::escrow::state::{FundStatus, PayoutStatus, TransactionType};
use crate::escrow::store::{LedgerStore, MemoryLedgerStore};
use crate::escrow::types::{EventKind, PaymentEvent};
use crate::fee::StaticFeeSchedule;
use crate::processor::SandboxProcessor;

struct TestHarness {
    engine: Arc<IngestionEngine>,
    store: Arc<MemoryLedgerStore>,
    processor: Arc<SandboxProcessor>,
    acks: mpsc::UnboundedReceiver<PaymentEvent>,
}

impl TestHarness {
    fn new() -> Self {
        let (ack_tx, acks) = mpsc::unbounded_channel();
        let store = Arc::new(MemoryLedgerStore::new());
        let processor = Arc::new(SandboxProcessor::new().with_acks(ack_tx));
        let dispatcher = Arc::new(PayoutDispatcher::new(
            store.clone(),
            processor.clone(),
            DispatcherConfig {
                backoff_base_ms: 1,
                backoff_max_ms: 2,
                ..DispatcherConfig::default()
            },
        ));
        let engine = Arc::new(IngestionEngine::new(
            store.clone(),
            Arc::new(StaticFeeSchedule::flat(100_000)),
            dispatcher,
            Arc::new(LogNotifier),
        ));
        Self {
            engine,
            store,
            processor,
            acks,
        }
    }

    /// Ingest in order, re-delivering deferred events until nothing moves
    async fn drain(&self, events: Vec<PaymentEvent>) {
        let mut pending = events;
        for _ in 0..10 {
            let mut deferred = Vec::new();
            for event in pending {
                if let IngestResult::Deferred(_) = self.engine.ingest(&event).await.unwrap() {
                    deferred.push(event);
                }
            }
            if deferred.is_empty() {
                return;
            }
            pending = deferred;
        }
        panic!("events still deferred after redelivery");
    }

    /// Feed every processor acknowledgement back into the engine
    async fn deliver_acks(&mut self) {
        while let Ok(ack) = self.acks.try_recv() {
            self.engine.ingest(&ack).await.unwrap();
        }
    }
}

fn capture(id: &str, amount: u64) -> PaymentEvent {
    PaymentEvent::new(id, "b1", EventKind::CaptureConfirmed, amount, "usd")
        .payer("alice")
        .payment_reference("pi_1")
}

fn completed(id: &str) -> PaymentEvent {
    PaymentEvent::new(id, "b1", EventKind::BountyCompleted, 0, "usd").recipient("bob")
}

fn cancelled(id: &str, amount: u64) -> PaymentEvent {
    PaymentEvent::new(id, "b1", EventKind::BountyCancelled, amount, "usd").reason("abandoned")
}

// ============================================================================
// Happy paths
// ============================================================================

#[tokio::test]
async fn test_capture_complete_release() {
    let mut h = TestHarness::new();
    h.drain(vec![capture("e1", 10_000), completed("e2")]).await;
    h.deliver_acks().await;

    let fund = h.store.fund_by_bounty("b1").await.unwrap().unwrap();
    assert_eq!(fund.status, FundStatus::Released);
    assert_eq!(fund.platform_fee_amount, 1_000);
    assert_eq!(fund.net_amount, 9_000);
    assert_eq!(fund.pending_action, None);

    let payouts = h.store.payouts_for_fund(fund.id).await.unwrap();
    assert_eq!(payouts.len(), 1);
    assert_eq!(payouts[0].status, PayoutStatus::Completed);
    assert_eq!(payouts[0].amount, 9_000);

    let audit: Vec<TransactionType> = h
        .store
        .transactions_for_bounty("b1")
        .await
        .unwrap()
        .iter()
        .map(|t| t.tx_type)
        .collect();
    assert_eq!(audit, vec![TransactionType::PaymentIntent, TransactionType::Transfer]);
}

#[tokio::test]
async fn test_partial_refund() {
    let mut h = TestHarness::new();
    h.drain(vec![capture("e1", 5_000), cancelled("e2", 2_000)]).await;
    h.deliver_acks().await;

    let fund = h.store.fund_by_bounty("b1").await.unwrap().unwrap();
    assert_eq!(fund.status, FundStatus::Refunded);
    assert_eq!(fund.refund_amount, Some(2_000));
    assert_eq!(h.processor.refunds()[0].amount, 2_000);

    // Later completion bounces off the terminal record
    let version = fund.version;
    let result = h.engine.ingest(&completed("e9")).await.unwrap();
    assert!(matches!(
        result,
        IngestResult::Rejected(TransitionError::TerminalState { .. })
    ));
    let after = h.store.fund_by_bounty("b1").await.unwrap().unwrap();
    assert_eq!(after.version, version);
}

// ============================================================================
// Delivery anomalies
// ============================================================================

#[tokio::test]
async fn test_concurrent_redelivery_applies_once() {
    let h = TestHarness::new();
    let event = capture("e1", 10_000);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = h.engine.clone();
        let event = event.clone();
        tasks.push(tokio::spawn(async move { engine.ingest(&event).await }));
    }

    let mut applied = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(IngestResult::Applied { .. }) => applied += 1,
            Ok(IngestResult::Duplicate) => {}
            Ok(other) => panic!("unexpected result {:?}", other),
            // Lost the claim race mid-flight; redelivery sorts it out
            Err(e) => assert!(e.is_transient()),
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(
        h.engine.ingest(&event).await.unwrap(),
        IngestResult::Duplicate
    );

    let fund = h.store.fund_by_bounty("b1").await.unwrap().unwrap();
    assert_eq!(fund.version, 1);
    assert_eq!(h.store.transactions_for_bounty("b1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_permutations_converge() {
    let orders: [[usize; 3]; 6] = [
        [0, 1, 2],
        [0, 2, 1],
        [1, 0, 2],
        [1, 2, 0],
        [2, 0, 1],
        [2, 1, 0],
    ];

    for order in orders {
        let mut h = TestHarness::new();
        let events = [
            capture("e1", 10_000),
            completed("e2"),
            // Same capture replayed under a fresh id
            capture("e3", 10_000),
        ];
        h.drain(order.iter().map(|i| events[*i].clone()).collect())
            .await;
        h.deliver_acks().await;

        let fund = h.store.fund_by_bounty("b1").await.unwrap().unwrap();
        assert_eq!(fund.status, FundStatus::Released, "order {:?}", order);
        assert_eq!(fund.platform_fee_amount, 1_000, "order {:?}", order);
        assert_eq!(fund.net_amount, 9_000, "order {:?}", order);
        assert_eq!(h.processor.transfer_calls(), 1, "order {:?}", order);
    }
}

#[tokio::test]
async fn test_ack_before_completion_is_deferred() {
    let h = TestHarness::new();
    h.drain(vec![capture("e1", 10_000)]).await;

    let early = PaymentEvent::new("t1", "b1", EventKind::TransferSucceeded, 9_000, "usd");
    assert!(matches!(
        h.engine.ingest(&early).await.unwrap(),
        IngestResult::Deferred(_)
    ));
    assert!(!h.store.is_processed("t1").await.unwrap());
}

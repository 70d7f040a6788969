//! Background workers
//!
//! - [`IngestionWorkerPool`]: N tasks draining the bounded event queue fed by
//!   the webhook endpoint. Deferred events and transient failures are put back
//!   on the queue after a delay, up to `max_deferrals` times, then parked in
//!   the inbox. A final answer clears the inbox entry.
//! - [`RecoveryWorker`]: periodically re-drives dispatches that were lost
//!   between a committed transition and the processor call, and relays inbox
//!   entries that went idle (parked, or queued before a crash).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::dispatcher::PayoutDispatcher;
use super::error::{DispatchError, StoreError};
use super::ingest::{IngestResult, IngestionEngine};
use super::state::FundStatus;
use super::store::LedgerStore;
use super::types::{InboundEvent, PaymentEvent};
use crate::config::{DispatcherConfig, IngestionConfig};

/// Shutdown signal shared by all background tasks
pub struct ShutdownSignal {
    shutdown: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Request shutdown
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Check if shutdown was requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown has been requested
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_shutdown_requested() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Queued event plus how often it has been handed to a worker
#[derive(Debug, Clone)]
pub struct Envelope {
    pub event: PaymentEvent,
    pub deliveries: u32,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    #[error("Event queue is full")]
    Full,
    #[error("Event queue is closed")]
    Closed,
}

/// Producer side of the ingestion queue
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::Sender<Envelope>,
}

impl EventQueue {
    /// Enqueue without waiting; a full queue is reported as backpressure
    pub fn submit(&self, event: PaymentEvent) -> Result<(), QueueError> {
        self.tx
            .try_send(Envelope {
                event,
                deliveries: 0,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }

    /// Enqueue, waiting for capacity
    pub async fn enqueue(&self, event: PaymentEvent) -> Result<(), QueueError> {
        self.requeue(Envelope {
            event,
            deliveries: 0,
        })
        .await
    }

    async fn requeue(&self, envelope: Envelope) -> Result<(), QueueError> {
        self.tx.send(envelope).await.map_err(|_| QueueError::Closed)
    }
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("Inbox write failed: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Record `event` in the durable inbox, then queue it without waiting.
///
/// A full or closed queue is still reported so the sender backs off, but
/// once the inbox write succeeded the relay delivers the event regardless.
pub async fn accept_event(
    store: &dyn LedgerStore,
    queue: &EventQueue,
    event: PaymentEvent,
) -> Result<(), AcceptError> {
    if !store.inbox_put(&InboundEvent::queued(event.clone(), Utc::now())).await? {
        debug!(event_id = %event.id, "Event already in inbox");
    }
    queue.submit(event)?;
    Ok(())
}

pub type EventReceiver = mpsc::Receiver<Envelope>;

/// Create the bounded ingestion queue
pub fn event_queue(size: usize) -> (EventQueue, EventReceiver) {
    let (tx, rx) = mpsc::channel(size.max(1));
    (EventQueue { tx }, rx)
}

/// Ingestion counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    deferred: AtomicU64,
    /// Moved to the inbox's parked set from the live path
    parked: AtomicU64,
    failed: AtomicU64,
    /// Settled by the inbox relay
    relayed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub deferred: u64,
    pub parked: u64,
    pub failed: u64,
    pub relayed: u64,
}

impl WorkerStats {
    #[inline]
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            relayed: self.relayed.load(Ordering::Relaxed),
        }
    }
}

pub struct IngestionWorkerPool {
    engine: Arc<IngestionEngine>,
    queue: EventQueue,
    config: IngestionConfig,
    stats: Arc<WorkerStats>,
}

impl IngestionWorkerPool {
    pub fn new(engine: Arc<IngestionEngine>, queue: EventQueue, config: IngestionConfig) -> Self {
        Self {
            engine,
            queue,
            config,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Start `config.workers` tasks sharing `rx`
    pub fn spawn(
        self: &Arc<Self>,
        rx: EventReceiver,
        shutdown: Arc<ShutdownSignal>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(Mutex::new(rx));
        info!(workers = self.config.workers, "Starting ingestion workers");
        (0..self.config.workers)
            .map(|worker_id| {
                let pool = Arc::clone(self);
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(worker_id, rx, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<Mutex<EventReceiver>>,
        shutdown: Arc<ShutdownSignal>,
    ) {
        loop {
            let envelope = {
                let mut rx = rx.lock().await;
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => None,
                    msg = rx.recv() => msg,
                }
            };
            let Some(envelope) = envelope else {
                break;
            };
            self.handle(envelope).await;
        }
        debug!(worker_id, "Ingestion worker stopped");
    }

    /// Ingest one envelope; never fails the worker
    pub async fn handle(&self, mut envelope: Envelope) {
        envelope.deliveries += 1;
        match self.engine.ingest(&envelope.event).await {
            Ok(IngestResult::Deferred(reason)) => {
                WorkerStats::incr(&self.stats.deferred);
                self.retry_later(envelope, &reason.to_string()).await;
            }
            Ok(result) => {
                self.record(&result);
                self.settle(&envelope.event.id).await;
            }
            Err(e) if e.is_transient() => {
                warn!(
                    event_id = %envelope.event.id,
                    code = e.code(),
                    error = %e,
                    "Ingestion failed, will retry"
                );
                self.retry_later(envelope, &e.to_string()).await;
            }
            Err(e) => {
                error!(
                    event_id = %envelope.event.id,
                    code = e.code(),
                    error = %e,
                    "Ingestion failed"
                );
                WorkerStats::incr(&self.stats.failed);
                WorkerStats::incr(&self.stats.parked);
                self.park(&envelope.event, &e.to_string()).await;
            }
        }
    }

    /// Relay pass: ingest each inbox entry idle since `older_than` once.
    ///
    /// Entries that still cannot be applied stay parked with a bumped attempt
    /// count. Returns how many entries got a final answer.
    pub async fn relay_inbox(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, StoreError> {
        let due = self.engine.store().inbox_due(older_than, limit).await?;
        let mut settled = 0;
        for entry in &due {
            let event = &entry.event;
            match self.engine.ingest(event).await {
                Ok(IngestResult::Deferred(reason)) => self.park(event, &reason.to_string()).await,
                Ok(result) => {
                    self.record(&result);
                    WorkerStats::incr(&self.stats.relayed);
                    self.settle(&event.id).await;
                    settled += 1;
                }
                Err(e) => self.park(event, &e.to_string()).await,
            }
        }
        if !due.is_empty() {
            info!(due = due.len(), settled, "Inbox relay pass complete");
        }
        Ok(settled)
    }

    fn record(&self, result: &IngestResult) {
        match result {
            IngestResult::Applied { .. } => WorkerStats::incr(&self.stats.applied),
            IngestResult::Duplicate => WorkerStats::incr(&self.stats.duplicates),
            IngestResult::Rejected(_) => WorkerStats::incr(&self.stats.rejected),
            IngestResult::Deferred(_) => WorkerStats::incr(&self.stats.deferred),
        }
    }

    /// The ledger has a final answer; the inbox no longer needs the event
    async fn settle(&self, event_id: &str) {
        if let Err(e) = self.engine.store().inbox_remove(event_id).await {
            warn!(event_id, error = %e, "Failed to clear inbox entry");
        }
    }

    async fn park(&self, event: &PaymentEvent, reason: &str) {
        match self.engine.store().inbox_park(event, reason, Utc::now()).await {
            Ok(()) => warn!(
                event_id = %event.id,
                bounty_id = %event.bounty_id,
                reason,
                "Event parked for relay"
            ),
            Err(e) => error!(
                event_id = %event.id,
                bounty_id = %event.bounty_id,
                reason,
                error = %e,
                "Failed to park event"
            ),
        }
    }

    async fn retry_later(&self, envelope: Envelope, reason: &str) {
        if envelope.deliveries > self.config.max_deferrals {
            WorkerStats::incr(&self.stats.parked);
            self.park(&envelope.event, reason).await;
            return;
        }

        let delay = self.config.defer_delay() * envelope.deliveries;
        let queue = self.queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let event_id = envelope.event.id.clone();
            if queue.requeue(envelope).await.is_err() {
                debug!(event_id = %event_id, "Queue closed, deferred event left to the inbox relay");
            }
        });
    }
}

/// Recovery worker settings
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    pub scan_interval: Duration,
    /// How long a held fund must sit idle before it is considered stuck
    pub stale_threshold: Duration,
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            stale_threshold: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

impl From<&DispatcherConfig> for RecoveryConfig {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            scan_interval: Duration::from_secs(config.recovery_interval_secs.max(1)),
            stale_threshold: Duration::from_secs(config.stale_after_secs),
            ..Self::default()
        }
    }
}

/// Re-drives outbound movements stuck after a crash or processor outage
pub struct RecoveryWorker {
    store: Arc<dyn LedgerStore>,
    dispatcher: Arc<PayoutDispatcher>,
    config: RecoveryConfig,
    inbox: Option<Arc<IngestionWorkerPool>>,
}

impl RecoveryWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        dispatcher: Arc<PayoutDispatcher>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            inbox: None,
        }
    }

    /// Also relay idle inbox entries through `pool` on every scan
    pub fn with_inbox(mut self, pool: Arc<IngestionWorkerPool>) -> Self {
        self.inbox = Some(pool);
        self
    }

    fn cutoff(&self) -> DateTime<Utc> {
        let stale = chrono::Duration::from_std(self.config.stale_threshold)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() - stale
    }

    /// Scan until shutdown
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            stale_threshold_secs = self.config.stale_threshold.as_secs(),
            "Starting recovery worker"
        );

        while !shutdown.is_shutdown_requested() {
            if let Err(e) = self.scan_and_recover().await {
                error!(error = %e, "Recovery scan failed");
            }
            if let Some(pool) = &self.inbox {
                if let Err(e) = pool.relay_inbox(self.cutoff(), self.config.batch_size).await {
                    error!(error = %e, "Inbox relay failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = shutdown.wait() => {}
            }
        }
        info!("Recovery worker stopped");
    }

    /// One scan; returns how many funds got a payout attempt moving again
    pub async fn scan_and_recover(&self) -> Result<usize, DispatchError> {
        let cutoff = self.cutoff();

        let candidates: Vec<_> = self
            .store
            .funds_for_reconciliation(cutoff, self.config.batch_size)
            .await?
            .into_iter()
            .filter(|f| {
                f.status == FundStatus::Held
                    && f.in_flight().is_some()
                    && !f.flagged
                    && f.updated_at < cutoff
            })
            .collect();

        if candidates.is_empty() {
            debug!("No stuck payouts found");
            return Ok(0);
        }

        let mut recovered = 0;
        for fund in &candidates {
            match self.dispatcher.resume(fund).await {
                Ok(Some(payout)) => {
                    info!(
                        bounty_id = %fund.bounty_id,
                        payout_id = %payout.id,
                        attempt = payout.attempt,
                        status = %payout.status,
                        "Payout recovered"
                    );
                    recovered += 1;
                }
                Ok(None) => {}
                Err(e) => error!(
                    bounty_id = %fund.bounty_id,
                    code = e.code(),
                    error = %e,
                    "Failed to recover payout"
                ),
            }
        }

        if recovered > 0 {
            info!(recovered, scanned = candidates.len(), "Recovery scan complete");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait().await })
        };
        tokio::task::yield_now().await;
        signal.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already requested: returns immediately
        signal.wait().await;
    }

    #[test]
    fn test_queue_backpressure() {
        let (queue, _rx) = event_queue(1);
        let event = || {
            PaymentEvent::new(
                "e1",
                "b1",
                crate::escrow::types::EventKind::CaptureConfirmed,
                100,
                "usd",
            )
        };
        assert!(queue.submit(event()).is_ok());
        assert_eq!(queue.submit(event()), Err(QueueError::Full));
    }

    #[test]
    fn test_recovery_config_from_dispatcher() {
        let config = RecoveryConfig::from(&DispatcherConfig {
            recovery_interval_secs: 0,
            stale_after_secs: 120,
            ..DispatcherConfig::default()
        });
        assert_eq!(config.scan_interval, Duration::from_secs(1));
        assert_eq!(config.stale_threshold, Duration::from_secs(120));
    }
}

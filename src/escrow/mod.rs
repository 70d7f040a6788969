//! Escrow fund lifecycle
//!
//! One [`FundRecord`] per funded bounty, driven by events from the payment
//! processor feed and the bounty product:
//!
//! ```text
//!                capture_confirmed
//!   PENDING(0) ────────────────────▶ HELD(10) ──┬─ bounty_completed ─▶ [transfer in flight]
//!                                               │      transfer_succeeded ─▶ RELEASED(20)
//!                                               │      transfer_failed ────▶ retry (≤ 5), then flagged
//!                                               │
//!                                               └─ bounty_cancelled ─▶ [refund in flight]
//!                                                      refund_succeeded ───▶ REFUNDED(-10)
//!                                                      refund_failed ──────▶ retry (≤ 5), then flagged
//! ```
//!
//! # Components
//!
//! - [`validator`] - pure transition function
//! - [`ingest`] - idempotent, row-locked application of one event
//! - [`dispatcher`] - transfer/refund attempts against the processor
//! - [`reconcile`] - periodic drift detection
//! - [`query`] - derived balances and histories
//! - [`worker`] - ingestion worker pool, inbox relay and dispatch recovery
//! - [`store`] - PostgreSQL and in-memory persistence

pub mod dispatcher;
pub mod error;
pub mod ingest;
pub mod notify;
pub mod query;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod types;
pub mod validator;
pub mod worker;

#[cfg(all(test, feature = "mock-api"))]
mod integration_tests;

pub use dispatcher::PayoutDispatcher;
pub use error::{DispatchError, IngestError, ReconcileError, StoreError, TransitionError};
pub use ingest::{IngestResult, IngestionEngine};
pub use notify::{LogNotifier, Notification, NotificationKind, Notifier};
pub use query::{Balance, FundView, LedgerQueries, VisibleStatus};
pub use reconcile::{ReconciliationJob, ReconciliationReport};
pub use state::{
    DiscrepancyKind, FundStatus, InboxStatus, PayoutKind, PayoutStatus, TransactionType,
};
pub use store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};
pub use types::{
    EventKind, FundRecord, InboundEvent, PaymentEvent, PayoutRecord, TransactionRecord,
};
pub use validator::TransitionValidator;
pub use worker::{
    AcceptError, EventQueue, IngestionWorkerPool, RecoveryConfig, RecoveryWorker, ShutdownSignal,
    accept_event, event_queue,
};

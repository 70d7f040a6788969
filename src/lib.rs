//! Escrow Ledger - Fund lifecycle engine for a bounty marketplace
//!
//! Tracks money from capture through escrow to release or refund while
//! staying consistent with an asynchronous, at-least-once payment processor.
//!
//! # Modules
//!
//! - [`money`] - Minor-unit amounts and display conversion
//! - [`fee`] - Platform fee split and fee schedule lookup
//! - [`escrow`] - Fund records, transition validator, ingestion, payouts, reconciliation
//! - [`processor`] - Payment processor command/query seam
//! - [`gateway`] - Webhook receiver and read-only query endpoints
//! - [`config`] - YAML application configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL connection management

pub mod config;
pub mod db;
pub mod escrow;
pub mod fee;
pub mod gateway;
pub mod logging;
pub mod money;
pub mod processor;

// Convenient re-exports at crate root
pub use escrow::{
    FundRecord, FundStatus, IngestResult, IngestionEngine, PaymentEvent, PayoutDispatcher,
    PayoutRecord, ReconciliationJob, TransitionError, TransitionValidator,
};
pub use money::Amount;

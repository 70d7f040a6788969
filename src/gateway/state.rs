use std::sync::Arc;

use crate::escrow::query::LedgerQueries;
use crate::escrow::store::LedgerStore;
use crate::escrow::worker::{EventQueue, WorkerStats};

/// Shared gateway state
#[derive(Clone)]
pub struct AppState {
    /// Producer side of the ingestion queue
    pub queue: EventQueue,
    pub queries: Arc<LedgerQueries>,
    /// Used by the health check
    pub store: Arc<dyn LedgerStore>,
    pub stats: Arc<WorkerStats>,
}

impl AppState {
    pub fn new(queue: EventQueue, store: Arc<dyn LedgerStore>, stats: Arc<WorkerStats>) -> Self {
        Self {
            queue,
            queries: Arc::new(LedgerQueries::new(store.clone())),
            store,
            stats,
        }
    }
}

//! Escrow Ledger service
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌───────────┐    ┌──────────┐
//! │ Webhook  │───▶│  Queue   │───▶│ Ingestion │───▶│  Ledger  │
//! │  (HTTP)  │    │ (mpsc)   │    │  workers  │    │  store   │
//! └────┬─────┘    └──────────┘    └─────┬─────┘    └────┬─────┘
//!      └──────── inbox (durable) ───────┼───────────────┘
//!                                       ▼
//!                                 ┌───────────┐    ┌───────────┐
//!                                 │  Payout   │───▶│ Processor │
//!                                 │dispatcher │    │           │
//!                                 └───────────┘    └───────────┘
//! ```
//!
//! Flags: `--env <name>` (config/<name>.yaml), `--memory` (in-memory store and
//! sandbox processor), `--port <n>`, `--reconcile-once`.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use escrow_ledger::config::AppConfig;
use escrow_ledger::db::Database;
use escrow_ledger::escrow::store::{LedgerStore, PgLedgerStore};
use escrow_ledger::escrow::worker::{EventQueue, IngestionWorkerPool, RecoveryConfig, RecoveryWorker};
use escrow_ledger::escrow::{
    IngestionEngine, LogNotifier, PayoutDispatcher, ReconciliationJob, ShutdownSignal, event_queue,
};
use escrow_ledger::fee::StaticFeeSchedule;
use escrow_ledger::gateway::{run_server, state::AppState};
use escrow_ledger::logging::init_logging;
use escrow_ledger::processor::{HttpProcessor, PaymentProcessor};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_memory_mode() -> bool {
    std::env::args().any(|a| a == "--memory")
}

fn use_reconcile_once() -> bool {
    std::env::args().any(|a| a == "--reconcile-once")
}

/// Get port override from command line (--port argument)
fn get_port_override() -> Option<u16> {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--port" && i + 1 < args.len() {
            return args[i + 1].parse().ok();
        }
    }
    None
}

type Backends = (Arc<dyn LedgerStore>, Arc<dyn PaymentProcessor>);

async fn postgres_backends(config: &AppConfig) -> Result<Backends> {
    let url = config
        .postgres_url
        .as_deref()
        .context("postgres_url is not configured (use --memory for a local run)")?;
    let db = Database::connect(url)
        .await
        .context("connecting to PostgreSQL")?;
    db.migrate().await.context("applying ledger schema")?;

    let store = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let processor = Arc::new(HttpProcessor::new(&config.processor)?);
    Ok((store, processor))
}

/// In-memory store plus sandbox processor whose acknowledgements loop back
/// through the inbox into the ingestion queue
#[cfg(feature = "mock-api")]
fn memory_backends(queue: &EventQueue) -> Result<Backends> {
    use escrow_ledger::escrow::MemoryLedgerStore;
    use escrow_ledger::escrow::types::InboundEvent;
    use escrow_ledger::processor::SandboxProcessor;

    let store: Arc<dyn LedgerStore> = Arc::new(MemoryLedgerStore::new());
    let (ack_tx, mut acks) = tokio::sync::mpsc::unbounded_channel();
    {
        let store = store.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            while let Some(event) = acks.recv().await {
                let entry = InboundEvent::queued(event, Utc::now());
                if let Err(e) = store.inbox_put(&entry).await {
                    error!(event_id = %entry.event.id, error = %e, "Failed to record acknowledgement");
                }
                if queue.enqueue(entry.event).await.is_err() {
                    break;
                }
            }
        });
    }

    info!("Using in-memory ledger store and sandbox processor");
    Ok((store, Arc::new(SandboxProcessor::new().with_acks(ack_tx))))
}

#[cfg(not(feature = "mock-api"))]
fn memory_backends(_queue: &EventQueue) -> Result<Backends> {
    anyhow::bail!("--memory requires the `mock-api` feature")
}

#[tokio::main]
async fn main() -> Result<()> {
    let env = get_env();
    let config =
        AppConfig::load(&env).with_context(|| format!("loading config/{}.yaml", env))?;
    let _log_guard = init_logging(&config);

    info!(env = %env, version = env!("GIT_HASH"), "Starting escrow ledger");

    let shutdown = Arc::new(ShutdownSignal::new());
    let (queue, rx) = event_queue(config.gateway.queue_size);

    let (store, processor) = if use_memory_mode() {
        memory_backends(&queue)?
    } else {
        postgres_backends(&config).await?
    };

    let reconciler = ReconciliationJob::new(
        store.clone(),
        processor.clone(),
        config.reconciliation.clone(),
    )
    .with_max_attempts(config.dispatcher.max_attempts);

    if use_reconcile_once() {
        let report = reconciler.run_once(Utc::now(), &shutdown).await?;
        info!(
            examined = report.examined,
            discrepancies = report.discrepancies,
            errors = report.errors,
            "Reconciliation complete"
        );
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let fees = Arc::new(StaticFeeSchedule::from_config(&config.fees)?.with_ledger(store.clone()));
    let dispatcher = Arc::new(PayoutDispatcher::new(
        store.clone(),
        processor,
        config.dispatcher.clone(),
    ));
    let engine = Arc::new(
        IngestionEngine::new(store.clone(), fees, dispatcher.clone(), Arc::new(LogNotifier))
            .with_operator_id(config.operator_id.clone()),
    );

    let pool = Arc::new(IngestionWorkerPool::new(
        engine,
        queue.clone(),
        config.ingestion.clone(),
    ));
    let workers = pool.spawn(rx, shutdown.clone());

    let recovery = RecoveryWorker::new(
        store.clone(),
        dispatcher,
        RecoveryConfig::from(&config.dispatcher),
    )
    .with_inbox(pool.clone());
    let recovery_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { recovery.run(shutdown).await })
    };
    let reconcile_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown requested"),
                Err(e) => error!(error = %e, "Failed to listen for ctrl-c"),
            }
            shutdown.request_shutdown();
        });
    }

    let port = get_port_override().unwrap_or(config.gateway.port);
    let addr = format!("{}:{}", config.gateway.host, port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    let state = Arc::new(AppState::new(queue, store, pool.stats()));
    run_server(listener, state, shutdown.clone()).await?;

    // Server is down: stop background work and let in-flight events finish
    shutdown.request_shutdown();
    for worker in workers {
        let _ = worker.await;
    }
    let _ = recovery_task.await;
    let _ = reconcile_task.await;

    let stats = pool.stats().snapshot();
    info!(
        applied = stats.applied,
        duplicates = stats.duplicates,
        rejected = stats.rejected,
        deferred = stats.deferred,
        parked = stats.parked,
        relayed = stats.relayed,
        "Escrow ledger stopped"
    );
    Ok(())
}

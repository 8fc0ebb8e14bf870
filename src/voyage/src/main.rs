//! Voyage — distributed journey execution engine.
//!
//! Main entry point: loads configuration, wires the queue, lock and store
//! seams, and runs the worker pool and delay scheduler for this node's role.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use voyage_core::config::AppConfig;
use voyage_core::events::noop_sink;
use voyage_engine::{Broker, MemoryBroker, NatsBroker, NoOpExecutor, WorkerPool};
use voyage_locks::{LockManager, MemoryLockManager, RedisLockManager};
use voyage_scheduler::Scheduler;
use voyage_store::{MemoryCustomerStore, MemoryJourneyStore, MemoryLocationStore};

#[derive(Parser, Debug)]
#[command(name = "voyage")]
#[command(about = "Distributed journey execution engine")]
#[command(version)]
struct Cli {
    /// Node identifier (overrides config)
    #[arg(long, env = "VOYAGE__NODE_ID")]
    node_id: Option<String>,

    /// Process role: "worker", "scheduler" or "all" (overrides config)
    #[arg(long, env = "VOYAGE__ROLE")]
    role: Option<String>,

    /// Number of workers per node (overrides config)
    #[arg(long, env = "VOYAGE__WORKERS_PER_NODE")]
    workers: Option<usize>,

    /// Run with in-process queue and locks instead of NATS and Redis
    #[arg(long, default_value_t = false)]
    local: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voyage=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Voyage starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(role) = cli.role {
        config.role = role;
    }
    if let Some(workers) = cli.workers {
        config.workers_per_node = workers;
    }

    info!(
        node_id = %config.node_id,
        role = %config.role,
        workers = config.workers_per_node,
        local = cli.local,
        "Configuration loaded"
    );

    let poll_timeout = Duration::from_millis(config.engine.poll_interval_ms);
    let (broker, locks): (Arc<dyn Broker>, Arc<dyn LockManager>) = if cli.local {
        info!("Running with in-process queue and locks");
        (
            Arc::new(MemoryBroker::new()),
            Arc::new(MemoryLockManager::new()),
        )
    } else {
        (
            Arc::new(NatsBroker::connect(&config.nats, poll_timeout).await?),
            Arc::new(RedisLockManager::new(&config.redis).await?),
        )
    };

    // Definition, location and customer stores for this node. The relational
    // implementations live with the deployment; these back a single node.
    let journeys = Arc::new(MemoryJourneyStore::new());
    let locations = Arc::new(MemoryLocationStore::new());
    let customers = Arc::new(MemoryCustomerStore::new());
    let events = noop_sink();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let run_workers = matches!(config.role.as_str(), "worker" | "all");
    let run_scheduler = matches!(config.role.as_str(), "scheduler" | "all");
    if !run_workers && !run_scheduler {
        anyhow::bail!("unknown role {:?}; expected worker, scheduler or all", config.role);
    }

    let mut pool = WorkerPool::new(
        config.clone(),
        journeys.clone(),
        locations.clone(),
        customers,
        locks,
        broker.clone(),
        Arc::new(NoOpExecutor),
        events,
    );
    if run_workers {
        pool.start();
    }

    let scheduler_handle = if run_scheduler {
        let scheduler = Scheduler::new(config.scheduler.clone(), locations, broker);
        Some(scheduler.spawn(shutdown_rx))
    } else {
        None
    };

    info!("Voyage is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    pool.stop();
    let _ = shutdown_tx.send(true);
    pool.wait().await;
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }

    info!("Voyage stopped");
    Ok(())
}

//! Worker pool — spawns and supervises N journey workers per node.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use voyage_core::config::AppConfig;
use voyage_core::events::EventSink;
use voyage_locks::LockManager;
use voyage_store::{CustomerStore, JourneyStore, LocationStore};

use crate::broker::Broker;
use crate::effect::EffectExecutor;
use crate::processor::StepProcessor;
use crate::worker::JourneyWorker;

/// Manages the lifecycle of all journey workers on this node.
pub struct WorkerPool {
    config: AppConfig,
    journeys: Arc<dyn JourneyStore>,
    locations: Arc<dyn LocationStore>,
    customers: Arc<dyn CustomerStore>,
    locks: Arc<dyn LockManager>,
    broker: Arc<dyn Broker>,
    effects: Arc<dyn EffectExecutor>,
    events: Arc<dyn EventSink>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        journeys: Arc<dyn JourneyStore>,
        locations: Arc<dyn LocationStore>,
        customers: Arc<dyn CustomerStore>,
        locks: Arc<dyn LockManager>,
        broker: Arc<dyn Broker>,
        effects: Arc<dyn EffectExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            journeys,
            locations,
            customers,
            locks,
            broker,
            effects,
            events,
            shutdown,
            handles: Vec::new(),
        }
    }

    /// Spawn all workers for this node.
    pub fn start(&mut self) {
        for i in 0..self.config.workers_per_node {
            let worker_id = format!("{}-worker-{:02}", self.config.node_id, i);

            let processor = Arc::new(StepProcessor::new(
                worker_id.clone(),
                self.config.engine.clone(),
                self.journeys.clone(),
                self.locations.clone(),
                self.customers.clone(),
                self.locks.clone(),
                self.broker.clone(),
                self.effects.clone(),
                self.events.clone(),
            ));

            let worker = JourneyWorker::new(worker_id.clone(), self.broker.clone(), processor);
            let handle = worker.spawn(self.shutdown.subscribe());
            self.handles.push(handle);

            info!(worker_id = %worker_id, "Worker spawned");
        }

        info!(
            count = self.config.workers_per_node,
            node = %self.config.node_id,
            "All workers started"
        );
    }

    /// Signal every worker to stop after its current request.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for all workers to complete (blocks until shutdown).
    pub async fn wait(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }
}

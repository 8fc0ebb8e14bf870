//! Individual journey worker — a Tokio task that polls the advancement queue
//! and drives each request through the step processor.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::processor::{Disposition, StepProcessor};

/// A single autonomous advancement worker.
pub struct JourneyWorker {
    pub worker_id: String,
    broker: Arc<dyn Broker>,
    processor: Arc<StepProcessor>,
}

impl JourneyWorker {
    pub fn new(worker_id: String, broker: Arc<dyn Broker>, processor: Arc<StepProcessor>) -> Self {
        Self {
            worker_id,
            broker,
            processor,
        }
    }

    /// Spawn this worker as a Tokio task. The task drains the queue until the
    /// shutdown signal flips or the broker's subscription ends.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker_id = self.worker_id.clone();

        tokio::spawn(async move {
            info!(worker_id = %worker_id, "Worker started");

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let dequeued = tokio::select! {
                    result = self.broker.dequeue() => result,
                    _ = shutdown.changed() => continue,
                };

                let request = match dequeued {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Dequeue failed; worker exiting");
                        break;
                    }
                };

                match self.processor.process(request).await {
                    Ok(Disposition::Discarded(why)) => {
                        debug!(worker_id = %worker_id, why = %why, "Request discarded");
                    }
                    Ok(disposition) => {
                        debug!(worker_id = %worker_id, disposition = ?disposition, "Request processed");
                    }
                    Err(e) => {
                        error!(worker_id = %worker_id, error = %e, "Processing failed");
                        metrics::counter!("worker.processing_errors").increment(1);
                    }
                }
            }

            info!(worker_id = %worker_id, "Worker stopped");
        })
    }
}

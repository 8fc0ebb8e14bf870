use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use voyage_core::config::SchedulerConfig;
use voyage_core::types::{AdvanceReason, AdvancementRequest};
use voyage_core::EngineResult;
use voyage_engine::Broker;
use voyage_store::LocationStore;

pub struct Scheduler {
    config: SchedulerConfig,
    locations: Arc<dyn LocationStore>,
    broker: Arc<dyn Broker>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        locations: Arc<dyn LocationStore>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            config,
            locations,
            broker,
        }
    }

    /// One scan pass: enqueue a `DelayElapsed` request for every location
    /// whose wake-up time has passed. Returns how many were enqueued.
    pub async fn scan_once(&self) -> EngineResult<usize> {
        let due = self
            .locations
            .due(Utc::now(), self.config.batch_size)
            .await?;

        let mut enqueued = 0;
        for location in due {
            let request = AdvancementRequest::new(
                location.journey_id,
                location.customer_id.clone(),
                location.current_node_id,
                AdvanceReason::DelayElapsed,
            );
            if let Err(e) = self.broker.enqueue(request, Duration::ZERO).await {
                // Leave the schedule in place; the next scan retries.
                warn!(
                    journey_id = %location.journey_id,
                    customer_id = %location.customer_id,
                    error = %e,
                    "Failed to enqueue delay wake-up"
                );
                continue;
            }
            enqueued += 1;
        }

        if enqueued > 0 {
            info!(enqueued, "Delay scan enqueued wake-ups");
        }
        metrics::counter!("scheduler.enqueued").increment(enqueued as u64);
        metrics::counter!("scheduler.scans").increment(1);
        Ok(enqueued)
    }

    /// Spawn the scan loop as a Tokio task.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick =
                tokio::time::interval(Duration::from_millis(self.config.scan_interval_ms));
            info!(
                interval_ms = self.config.scan_interval_ms,
                batch_size = self.config.batch_size,
                "Scheduler started"
            );

            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = self.scan_once().await {
                            error!(error = %e, "Delay scan failed");
                            metrics::counter!("scheduler.scan_errors").increment(1);
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Scheduler stopped");
        })
    }
}

//! Advancement-request queue seam. Delivery is at-least-once; duplicates are
//! absorbed downstream by the lease and the compare-and-move check.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use voyage_core::config::NatsConfig;
use voyage_core::types::AdvancementRequest;
use voyage_core::{EngineError, EngineResult};

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publishes a request, visible to consumers after `delay`.
    async fn enqueue(&self, request: AdvancementRequest, delay: Duration) -> EngineResult<()>;

    /// Next available request, or `None` when the poll window elapses empty.
    async fn dequeue(&self) -> EngineResult<Option<AdvancementRequest>>;

    /// Parks an exhausted or fatally failed request for operator attention.
    async fn dead_letter(&self, request: AdvancementRequest, reason: &str) -> EngineResult<()>;
}

/// A dead-lettered request together with why it was parked.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub request: AdvancementRequest,
    pub reason: String,
}

struct QueuedEntry {
    visible_at: DateTime<Utc>,
    request: AdvancementRequest,
}

/// In-memory broker for tests and single-node deployments. Models message
/// visibility time explicitly so delayed requeues are deterministic to test.
#[derive(Default)]
pub struct MemoryBroker {
    queue: Mutex<Vec<QueuedEntry>>,
    dead: Mutex<Vec<DeadLetter>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages currently queued, visible or not.
    pub fn depth(&self) -> usize {
        self.queue.lock().expect("broker mutex poisoned").len()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().expect("broker mutex poisoned").clone()
    }

    /// Drains every queued message regardless of visibility. Test helper for
    /// driving the queue to quiescence without waiting out delays.
    pub fn drain_all(&self) -> Vec<AdvancementRequest> {
        let mut queue = self.queue.lock().expect("broker mutex poisoned");
        queue.drain(..).map(|e| e.request).collect()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn enqueue(&self, request: AdvancementRequest, delay: Duration) -> EngineResult<()> {
        let visible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.queue
            .lock()
            .expect("broker mutex poisoned")
            .push(QueuedEntry {
                visible_at,
                request,
            });
        metrics::counter!("broker.enqueued").increment(1);
        Ok(())
    }

    async fn dequeue(&self) -> EngineResult<Option<AdvancementRequest>> {
        let now = Utc::now();
        let mut queue = self.queue.lock().expect("broker mutex poisoned");
        let next_due = queue
            .iter()
            .enumerate()
            .filter(|(_, e)| e.visible_at <= now)
            .min_by_key(|(_, e)| e.visible_at)
            .map(|(i, _)| i);
        Ok(next_due.map(|i| queue.remove(i).request))
    }

    async fn dead_letter(&self, request: AdvancementRequest, reason: &str) -> EngineResult<()> {
        metrics::counter!("broker.dead_lettered").increment(1);
        self.dead
            .lock()
            .expect("broker mutex poisoned")
            .push(DeadLetter {
                request,
                reason: reason.to_string(),
            });
        Ok(())
    }
}

/// NATS-backed broker: competing consumers via a queue group, so any worker
/// on any replica may pick up any request.
pub struct NatsBroker {
    client: async_nats::Client,
    subject: String,
    dlq_subject: String,
    queue_group: String,
    poll_timeout: Duration,
    subscriber: tokio::sync::Mutex<Option<async_nats::Subscriber>>,
}

impl NatsBroker {
    pub async fn connect(config: &NatsConfig, poll_timeout: Duration) -> EngineResult<Self> {
        let url = config
            .urls
            .first()
            .cloned()
            .unwrap_or_else(|| "nats://localhost:4222".to_string());

        info!(url = %url, "Connecting to NATS");

        let client = async_nats::ConnectOptions::new()
            .max_reconnects(Some(config.max_reconnects))
            .connect(&url)
            .await
            .map_err(|e| EngineError::Broker(format!("NATS connect failed: {e}")))?;

        info!("NATS connection established");

        Ok(Self {
            client,
            subject: format!("{}.advance", config.subject_prefix),
            dlq_subject: format!("{}.advance.dlq", config.subject_prefix),
            queue_group: config.queue_group.clone(),
            poll_timeout,
            subscriber: tokio::sync::Mutex::new(None),
        })
    }

    async fn publish(&self, subject: String, request: &AdvancementRequest) -> EngineResult<()> {
        let payload = serde_json::to_vec(request)?;
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| EngineError::Broker(format!("publish failed: {e}")))
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn enqueue(&self, request: AdvancementRequest, delay: Duration) -> EngineResult<()> {
        metrics::counter!("broker.enqueued").increment(1);
        if delay.is_zero() {
            return self.publish(self.subject.clone(), &request).await;
        }

        // Core NATS has no delayed delivery; hold the message on a timer.
        let client = self.client.clone();
        let subject = self.subject.clone();
        let payload = serde_json::to_vec(&request)?;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = client.publish(subject, payload.into()).await {
                error!(error = %e, "Delayed publish failed");
            }
        });
        Ok(())
    }

    async fn dequeue(&self) -> EngineResult<Option<AdvancementRequest>> {
        let mut guard = self.subscriber.lock().await;
        if guard.is_none() {
            debug!(subject = %self.subject, group = %self.queue_group, "Subscribing to advancement queue");
            let sub = self
                .client
                .queue_subscribe(self.subject.clone(), self.queue_group.clone())
                .await
                .map_err(|e| EngineError::Broker(format!("subscribe failed: {e}")))?;
            *guard = Some(sub);
        }
        let sub = guard.as_mut().expect("subscriber just installed");

        match tokio::time::timeout(self.poll_timeout, sub.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(EngineError::Broker("subscription ended".into())),
            Ok(Some(msg)) => match serde_json::from_slice(&msg.payload) {
                Ok(request) => Ok(Some(request)),
                Err(e) => {
                    warn!(error = %e, "Failed to deserialize advancement request");
                    metrics::counter!("broker.deserialize_errors").increment(1);
                    Ok(None)
                }
            },
        }
    }

    async fn dead_letter(&self, request: AdvancementRequest, reason: &str) -> EngineResult<()> {
        warn!(
            journey_id = %request.journey_id,
            customer_id = %request.customer_id,
            reason = %reason,
            "Dead-lettering advancement request"
        );
        metrics::counter!("broker.dead_lettered").increment(1);
        self.publish(self.dlq_subject.clone(), &request).await
    }
}

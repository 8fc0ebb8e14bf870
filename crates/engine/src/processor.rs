//! Step processor — the state-machine executor behind every advancement
//! request. Re-validates journey and customer state, executes the step's
//! effect, computes the next location, and re-enqueues follow-on work, all
//! under a per-customer lease with a compare-and-move backstop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voyage_core::config::EngineConfig;
use voyage_core::events::{make_event, EventSink, EventType};
use voyage_core::types::{
    AdvanceReason, AdvancementRequest, CustomerSnapshot, EffectOutcome, Journey, JourneyStatus,
    Node, NodeKind,
};
use voyage_core::{EngineError, EngineResult};
use voyage_evaluator::{qualifies_for_entry, select_branch, EvalContext};
use voyage_graph::JourneyGraph;
use voyage_locks::{customer_key, Lease, LockManager};
use voyage_store::{CustomerStore, JourneyStore, LocationStore};

use crate::broker::Broker;
use crate::effect::EffectExecutor;

/// How a single advancement request was resolved. Expected concurrency
/// outcomes (stale duplicates, lost races) resolve to `Discarded`; they are
/// counted, never reported as failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Location moved to a new node and follow-on work was enqueued.
    Advanced,
    /// Delay node recorded its wake-up time; position unchanged.
    Scheduled,
    /// Customer reached an exit; location tombstoned.
    Completed,
    /// Message deferred back onto the queue.
    Requeued,
    /// Parked on the dead-letter path for operator attention.
    DeadLettered,
    /// Dropped as already-handled, not applicable, or exhausted.
    Discarded(&'static str),
}

pub struct StepProcessor {
    worker_id: String,
    config: EngineConfig,
    journeys: Arc<dyn JourneyStore>,
    locations: Arc<dyn LocationStore>,
    customers: Arc<dyn CustomerStore>,
    locks: Arc<dyn LockManager>,
    broker: Arc<dyn Broker>,
    effects: Arc<dyn EffectExecutor>,
    events: Arc<dyn EventSink>,
}

impl StepProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        worker_id: String,
        config: EngineConfig,
        journeys: Arc<dyn JourneyStore>,
        locations: Arc<dyn LocationStore>,
        customers: Arc<dyn CustomerStore>,
        locks: Arc<dyn LockManager>,
        broker: Arc<dyn Broker>,
        effects: Arc<dyn EffectExecutor>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            worker_id,
            config,
            journeys,
            locations,
            customers,
            locks,
            broker,
            effects,
            events,
        }
    }

    /// Processes one dequeued advancement request end to end.
    pub async fn process(&self, request: AdvancementRequest) -> EngineResult<Disposition> {
        let started = Instant::now();
        metrics::counter!("engine.requests").increment(1);

        // Lifecycle gate: read once per attempt, optimistically.
        let Some(journey) = self.journeys.get(request.journey_id).await? else {
            debug!(journey_id = %request.journey_id, "Journey vanished; discarding request");
            metrics::counter!("engine.discarded").increment(1);
            return Ok(Disposition::Discarded("journey not found"));
        };

        match journey.status {
            JourneyStatus::Deleted | JourneyStatus::Stopped => {
                debug!(journey_id = %journey.id, status = ?journey.status, "Journey terminal; discarding request");
                metrics::counter!("engine.discarded").increment(1);
                return Ok(Disposition::Discarded("journey terminal"));
            }
            JourneyStatus::Draft => {
                metrics::counter!("engine.discarded").increment(1);
                return Ok(Disposition::Discarded("journey not started"));
            }
            JourneyStatus::Paused => {
                // Alive but frozen: defer without spending the attempt budget
                // so resumed journeys pick up exactly where they left off.
                debug!(journey_id = %journey.id, "Journey paused; deferring request");
                metrics::counter!("engine.paused_deferred").increment(1);
                self.broker
                    .enqueue(
                        request.clone(),
                        Duration::from_millis(self.config.pause_requeue_ms),
                    )
                    .await?;
                return Ok(Disposition::Requeued);
            }
            JourneyStatus::Active => {}
        }

        let graph = match JourneyGraph::build(&journey) {
            Ok(graph) => graph,
            Err(e @ EngineError::MalformedGraph(_)) => {
                return self.dead_letter(request, &e.to_string()).await;
            }
            Err(e) => return Err(e),
        };

        // Pessimistic lease over this (journey, customer).
        let key = customer_key(request.journey_id, &request.customer_id);
        let lease = match self
            .locks
            .acquire(&key, Duration::from_millis(self.config.lease_ms))
            .await
        {
            Ok(lease) => lease,
            Err(EngineError::Busy(_)) => {
                // Another worker is handling this customer right now.
                metrics::counter!("engine.lock_busy").increment(1);
                return self.requeue_busy(request).await;
            }
            Err(e) => return Err(e),
        };

        self.locations
            .set_claim(
                request.journey_id,
                &request.customer_id,
                &self.worker_id,
                lease.valid_until,
            )
            .await?;

        let outcome = self.process_locked(&request, &journey, &graph, &lease).await;

        if let Err(e) = self
            .locations
            .clear_claim(request.journey_id, &request.customer_id)
            .await
        {
            warn!(error = %e, "Failed to clear claim");
        }
        if let Err(e) = self.locks.release(lease).await {
            warn!(error = %e, key = %key, "Failed to release lease");
        }

        metrics::histogram!("engine.step_latency_us")
            .record(started.elapsed().as_micros() as f64);

        match outcome {
            Ok(disposition) => Ok(disposition),
            Err(EngineError::Conflict(detail)) => {
                // Someone else already advanced this customer; the work is done.
                debug!(detail = %detail, "Concurrent advance detected; discarding");
                metrics::counter!("engine.conflicts").increment(1);
                Ok(Disposition::Discarded("concurrent advance"))
            }
            Err(e @ EngineError::MalformedGraph(_)) => {
                self.dead_letter(request, &e.to_string()).await
            }
            Err(e) => Err(e),
        }
    }

    /// Everything that runs while the lease is held.
    async fn process_locked(
        &self,
        request: &AdvancementRequest,
        journey: &Journey,
        graph: &JourneyGraph,
        lease: &Lease,
    ) -> EngineResult<Disposition> {
        let location = match self
            .locations
            .get(request.journey_id, &request.customer_id)
            .await?
        {
            Some(location) => {
                if location.current_node_id != request.triggering_node_id {
                    // A previous delivery already moved this customer on.
                    metrics::counter!("engine.stale_duplicates").increment(1);
                    return Ok(Disposition::Discarded("stale duplicate"));
                }
                location
            }
            None => {
                if request.reason != AdvanceReason::Entry {
                    // Customer already exited or never entered.
                    metrics::counter!("engine.discarded").increment(1);
                    return Ok(Disposition::Discarded("no location"));
                }
                let Some(snapshot) = self.customers.snapshot(&request.customer_id).await? else {
                    metrics::counter!("engine.discarded").increment(1);
                    return Ok(Disposition::Discarded("customer not found"));
                };
                if !qualifies_for_entry(journey, &snapshot, Utc::now()) {
                    metrics::counter!("engine.entry_rejected").increment(1);
                    return Ok(Disposition::Discarded("does not qualify"));
                }
                let entry_node = graph.entry_node().id;
                let location = self
                    .locations
                    .create(
                        request.journey_id,
                        &request.customer_id,
                        entry_node,
                        journey.entry_settings.allow_reentry,
                    )
                    .await?;
                info!(
                    journey_id = %journey.id,
                    customer_id = %request.customer_id,
                    "Customer entered journey"
                );
                metrics::counter!("engine.entries").increment(1);
                self.events.emit(make_event(
                    EventType::JourneyEntered,
                    journey.id,
                    Some(request.customer_id.clone()),
                    Some(entry_node),
                ));
                location
            }
        };

        let node = graph.require_node(location.current_node_id)?;

        match &node.kind {
            NodeKind::Entry => {
                let next = graph.next_linear(node.id).ok_or_else(|| {
                    EngineError::MalformedGraph(format!("entry node {} has no successor", node.id))
                })?;
                self.advance(request, journey, graph, node.id, next).await
            }

            NodeKind::Send { .. } => {
                let snapshot = self.snapshot_or_default(&request.customer_id).await?;
                let outcome = self.execute_with_renewal(node, &snapshot, lease).await?;
                match outcome {
                    EffectOutcome::Success => {
                        metrics::counter!("engine.effects_succeeded").increment(1);
                        let next = graph.next_linear(node.id).ok_or_else(|| {
                            EngineError::MalformedGraph(format!(
                                "send node {} has no successor",
                                node.id
                            ))
                        })?;
                        self.advance(request, journey, graph, node.id, next).await
                    }
                    EffectOutcome::Retryable { reason } => {
                        metrics::counter!("engine.effects_retryable").increment(1);
                        self.requeue_retryable(request.clone(), &reason).await
                    }
                    EffectOutcome::Fatal { reason } => {
                        metrics::counter!("engine.effects_fatal").increment(1);
                        self.dead_letter(request.clone(), &reason).await
                    }
                }
            }

            NodeKind::Delay { duration_secs } => {
                if request.reason == AdvanceReason::DelayElapsed {
                    let next = graph.next_linear(node.id).ok_or_else(|| {
                        EngineError::MalformedGraph(format!(
                            "delay node {} has no successor",
                            node.id
                        ))
                    })?;
                    self.advance(request, journey, graph, node.id, next).await
                } else {
                    // Never advance past a delay synchronously; record when
                    // the scheduler should come back for this customer.
                    let wake_at =
                        location.step_entered_at + chrono::Duration::seconds(*duration_secs as i64);
                    self.locations
                        .schedule(request.journey_id, &request.customer_id, node.id, wake_at)
                        .await?;
                    debug!(
                        journey_id = %journey.id,
                        customer_id = %request.customer_id,
                        wake_at = %wake_at,
                        "Delay scheduled"
                    );
                    metrics::counter!("engine.delays_scheduled").increment(1);
                    Ok(Disposition::Scheduled)
                }
            }

            NodeKind::Branch { .. } => {
                let snapshot = self.snapshot_or_default(&request.customer_id).await?;
                let mut ctx = EvalContext::new(&snapshot);
                if let Some(event) = request.event_context.as_ref() {
                    ctx = ctx.with_event(event);
                }
                let key = select_branch(node, &ctx)?;
                let next = graph.next_for_branch(node.id, key).ok_or_else(|| {
                    EngineError::MalformedGraph(format!(
                        "branch node {} has no edge for key {key:?}",
                        node.id
                    ))
                })?;
                debug!(
                    journey_id = %journey.id,
                    customer_id = %request.customer_id,
                    branch = %key,
                    "Branch selected"
                );
                self.advance(request, journey, graph, node.id, next).await
            }

            NodeKind::Exit => self.complete(request, journey, node.id).await,
        }
    }

    /// Compare-and-move to `to`, then either finish (exit) or enqueue the
    /// zero-delay follow-on. A `Conflict` here means another delivery of the
    /// same transition already won; the caller discards.
    async fn advance(
        &self,
        request: &AdvancementRequest,
        journey: &Journey,
        graph: &JourneyGraph,
        from: Uuid,
        to: Uuid,
    ) -> EngineResult<Disposition> {
        self.locations
            .compare_and_move(request.journey_id, &request.customer_id, from, to)
            .await?;

        metrics::counter!("engine.advanced").increment(1);
        self.events.emit(make_event(
            EventType::StepCompleted,
            journey.id,
            Some(request.customer_id.clone()),
            Some(from),
        ));

        let next_node = graph.require_node(to)?;
        if matches!(next_node.kind, NodeKind::Exit) {
            return self.complete(request, journey, to).await;
        }

        // Follow-on processing for the new node. Delay nodes also get one so
        // their wake-up time is recorded under the lease discipline.
        let follow_on = AdvancementRequest::new(
            request.journey_id,
            request.customer_id.clone(),
            to,
            AdvanceReason::BranchContinue,
        );
        self.broker.enqueue(follow_on, Duration::ZERO).await?;
        Ok(Disposition::Advanced)
    }

    async fn complete(
        &self,
        request: &AdvancementRequest,
        journey: &Journey,
        exit_node: Uuid,
    ) -> EngineResult<Disposition> {
        self.locations
            .tombstone(request.journey_id, &request.customer_id)
            .await?;
        info!(
            journey_id = %journey.id,
            customer_id = %request.customer_id,
            "Customer completed journey"
        );
        metrics::counter!("engine.completions").increment(1);
        self.events.emit(make_event(
            EventType::JourneyCompleted,
            journey.id,
            Some(request.customer_id.clone()),
            Some(exit_node),
        ));
        Ok(Disposition::Completed)
    }

    /// Runs the effect bounded by the configured timeout, renewing the lease
    /// on an interval so long-running effects never outlive it.
    async fn execute_with_renewal(
        &self,
        node: &Node,
        snapshot: &CustomerSnapshot,
        lease: &Lease,
    ) -> EngineResult<EffectOutcome> {
        let mut lease = lease.clone();
        let effect = self.effects.execute(node, snapshot);
        tokio::pin!(effect);

        let timeout = tokio::time::sleep(Duration::from_millis(self.config.effect_timeout_ms));
        tokio::pin!(timeout);

        let renew_every = Duration::from_millis(self.config.renew_interval_ms);
        let mut renew = tokio::time::interval_at(
            tokio::time::Instant::now() + renew_every,
            renew_every,
        );

        loop {
            tokio::select! {
                outcome = &mut effect => return Ok(outcome),
                _ = &mut timeout => {
                    warn!(node_id = %node.id, "Effect execution timed out");
                    metrics::counter!("engine.effect_timeouts").increment(1);
                    return Ok(EffectOutcome::Retryable { reason: "effect timed out".into() });
                }
                _ = renew.tick() => {
                    match self.locks.renew(&lease).await {
                        Ok(renewed) => lease = renewed,
                        Err(EngineError::LeaseExpired(_)) => {
                            // Can't guarantee exclusivity any more; back off and
                            // let compare-and-move arbitrate the retry.
                            warn!(node_id = %node.id, "Lease lapsed during effect execution");
                            return Ok(EffectOutcome::Retryable {
                                reason: "lease expired during effect".into(),
                            });
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    async fn snapshot_or_default(&self, customer_id: &str) -> EngineResult<CustomerSnapshot> {
        Ok(self
            .customers
            .snapshot(customer_id)
            .await?
            .unwrap_or_else(|| CustomerSnapshot::new(customer_id)))
    }

    /// Contention requeue: short jittered delay, attempt-capped. Exhaustion
    /// drops the message, since the competing worker is making progress.
    async fn requeue_busy(&self, request: AdvancementRequest) -> EngineResult<Disposition> {
        if request.attempt + 1 > self.config.max_attempts {
            debug!(
                customer_id = %request.customer_id,
                attempt = request.attempt,
                "Contention requeues exhausted; dropping"
            );
            return Ok(Disposition::Discarded("contention attempts exhausted"));
        }
        let jitter = rand::thread_rng().gen_range(0..=self.config.busy_requeue_ms / 2);
        let delay = Duration::from_millis(self.config.busy_requeue_ms + jitter);
        self.broker.enqueue(request.requeued(), delay).await?;
        Ok(Disposition::Requeued)
    }

    /// Effect-failure requeue: exponential backoff with jitter; exhaustion
    /// dead-letters.
    async fn requeue_retryable(
        &self,
        request: AdvancementRequest,
        reason: &str,
    ) -> EngineResult<Disposition> {
        if request.attempt + 1 > self.config.max_attempts {
            return self
                .dead_letter(request, &format!("retries exhausted: {reason}"))
                .await;
        }
        let delay = self.backoff_delay(request.attempt);
        debug!(
            customer_id = %request.customer_id,
            attempt = request.attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Requeueing after retryable failure"
        );
        self.broker.enqueue(request.requeued(), delay).await?;
        Ok(Disposition::Requeued)
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = exp.min(self.config.backoff_cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=capped / 4 + 1);
        Duration::from_millis(capped + jitter)
    }

    async fn dead_letter(
        &self,
        request: AdvancementRequest,
        reason: &str,
    ) -> EngineResult<Disposition> {
        error!(
            journey_id = %request.journey_id,
            customer_id = %request.customer_id,
            node_id = %request.triggering_node_id,
            reason = %reason,
            "Advancement dead-lettered"
        );
        metrics::counter!("engine.dead_lettered").increment(1);
        let mut event = make_event(
            EventType::DeadLettered,
            request.journey_id,
            Some(request.customer_id.clone()),
            Some(request.triggering_node_id),
        );
        event.detail = Some(reason.to_string());
        self.events.emit(event);
        self.broker.dead_letter(request, reason).await?;
        Ok(Disposition::DeadLettered)
    }
}

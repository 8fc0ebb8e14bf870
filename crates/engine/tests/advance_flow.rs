//! End-to-end advancement flows over the in-memory seams: entry, linear
//! sends, branches, delays, retries, dead letters and lifecycle gating.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use voyage_core::config::EngineConfig;
use voyage_core::events::{capture_sink, CaptureSink, EventType};
use voyage_core::types::{
    AdvanceReason, AdvancementRequest, BranchArm, Channel, CompareOp, Criteria, CustomerSnapshot,
    Edge, EffectOutcome, Journey, JourneyStatus, Node, NodeKind,
};
use voyage_engine::{Disposition, MemoryBroker, RecordingExecutor, StepProcessor};
use voyage_locks::{customer_key, LockManager, MemoryLockManager};
use voyage_store::{
    JourneyStore, LocationStore, MemoryCustomerStore, MemoryJourneyStore, MemoryLocationStore,
};

struct Harness {
    journeys: Arc<MemoryJourneyStore>,
    locations: Arc<MemoryLocationStore>,
    customers: Arc<MemoryCustomerStore>,
    locks: Arc<MemoryLockManager>,
    broker: Arc<MemoryBroker>,
    effects: Arc<RecordingExecutor>,
    events: Arc<CaptureSink>,
    processor: StepProcessor,
}

impl Harness {
    fn new() -> Self {
        // Tight retry timings so tests never wait on wall-clock backoff.
        let config = EngineConfig {
            max_attempts: 5,
            busy_requeue_ms: 1,
            backoff_base_ms: 1,
            backoff_cap_ms: 2,
            ..EngineConfig::default()
        };
        Self::with_config(config)
    }

    fn with_config(config: EngineConfig) -> Self {
        let journeys = Arc::new(MemoryJourneyStore::new());
        let locations = Arc::new(MemoryLocationStore::new());
        let customers = Arc::new(MemoryCustomerStore::new());
        let locks = Arc::new(MemoryLockManager::new());
        let broker = Arc::new(MemoryBroker::new());
        let effects = Arc::new(RecordingExecutor::new());
        let events = capture_sink();

        let processor = StepProcessor::new(
            "test-worker".into(),
            config,
            journeys.clone(),
            locations.clone(),
            customers.clone(),
            locks.clone(),
            broker.clone(),
            effects.clone(),
            events.clone(),
        );

        Self {
            journeys,
            locations,
            customers,
            locks,
            broker,
            effects,
            events,
            processor,
        }
    }

    async fn put_active(&self, mut journey: Journey) -> Uuid {
        journey.status = JourneyStatus::Active;
        journey.status_version = 1;
        let id = journey.id;
        self.journeys.put(journey).await.unwrap();
        id
    }

    async fn add_customer(&self, snapshot: CustomerSnapshot) {
        self.customers.insert(snapshot);
    }

    /// Pumps the queue to quiescence, ignoring requeue delays. Panics if the
    /// queue never drains (a requeue loop).
    async fn drive(&self) -> Vec<Disposition> {
        let mut dispositions = Vec::new();
        for _ in 0..100 {
            let pending = self.broker.drain_all();
            if pending.is_empty() {
                return dispositions;
            }
            for request in pending {
                dispositions.push(self.processor.process(request).await.unwrap());
            }
        }
        panic!("queue did not quiesce");
    }
}

fn node(name: &str, kind: NodeKind) -> Node {
    Node {
        id: Uuid::new_v4(),
        name: name.into(),
        kind,
    }
}

fn send_node(name: &str) -> Node {
    node(
        name,
        NodeKind::Send {
            channel: Channel::Email,
            template_id: format!("tpl-{name}"),
        },
    )
}

fn edge(from: &Node, to: &Node) -> Edge {
    Edge {
        from: from.id,
        to: to.id,
        branch_key: None,
    }
}

fn keyed_edge(from: &Node, to: &Node, key: &str) -> Edge {
    Edge {
        from: from.id,
        to: to.id,
        branch_key: Some(key.into()),
    }
}

/// entry -> send -> exit. Returns (journey, send node id).
fn linear_journey() -> (Journey, Uuid) {
    let entry = node("entry", NodeKind::Entry);
    let send = send_node("welcome");
    let exit = node("exit", NodeKind::Exit);
    let send_id = send.id;
    let edges = vec![edge(&entry, &send), edge(&send, &exit)];
    (
        Journey::new("linear", Uuid::new_v4(), vec![entry, send, exit], edges),
        send_id,
    )
}

fn entry_request(journey: &Journey, customer_id: &str) -> AdvancementRequest {
    let entry_id = journey
        .nodes
        .iter()
        .find(|n| matches!(n.kind, NodeKind::Entry))
        .unwrap()
        .id;
    AdvancementRequest::new(journey.id, customer_id, entry_id, AdvanceReason::Entry)
}

#[tokio::test]
async fn test_linear_journey_runs_to_completion() {
    let h = Harness::new();
    let (journey, send_id) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::Advanced);

    let dispositions = h.drive().await;
    assert_eq!(dispositions, vec![Disposition::Completed]);

    // One effect, on the send node, and the customer is gone.
    assert_eq!(h.effects.executions(), vec![(send_id, "cust-1".to_string())]);
    assert!(h.locations.is_empty());
    assert_eq!(h.events.count_type(EventType::JourneyEntered), 1);
    assert_eq!(h.events.count_type(EventType::StepCompleted), 2);
    assert_eq!(h.events.count_type(EventType::JourneyCompleted), 1);
}

#[tokio::test]
async fn test_entry_rejected_when_criteria_not_met() {
    let h = Harness::new();
    let (mut journey, _) = linear_journey();
    journey.inclusion_criteria = Criteria::Attribute {
        key: "plan".into(),
        operator: CompareOp::Equals,
        value: json!("pro"),
    };
    let request = entry_request(&journey, "cust-free");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-free").with_attribute("plan", json!("free")))
        .await;

    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::Discarded("does not qualify"));
    assert!(h.locations.is_empty());
    assert_eq!(h.effects.count(), 0);
}

#[tokio::test]
async fn test_branch_routes_by_customer_attributes() {
    let h = Harness::new();
    let entry = node("entry", NodeKind::Entry);
    let split = node(
        "split",
        NodeKind::Branch {
            branches: vec![
                BranchArm {
                    key: "pro".into(),
                    condition: Criteria::Attribute {
                        key: "plan".into(),
                        operator: CompareOp::Equals,
                        value: json!("pro"),
                    },
                },
                BranchArm {
                    key: "default".into(),
                    condition: Criteria::Not {
                        clause: Box::new(Criteria::AllCustomers),
                    },
                },
            ],
        },
    );
    let send_pro = send_node("upsell");
    let send_basic = send_node("nudge");
    let exit = node("exit", NodeKind::Exit);
    let pro_id = send_pro.id;
    let basic_id = send_basic.id;

    let edges = vec![
        edge(&entry, &split),
        keyed_edge(&split, &send_pro, "pro"),
        keyed_edge(&split, &send_basic, "default"),
        edge(&send_pro, &exit),
        edge(&send_basic, &exit),
    ];
    let journey = Journey::new(
        "branching",
        Uuid::new_v4(),
        vec![entry, split, send_pro, send_basic, exit],
        edges,
    );
    let pro_request = entry_request(&journey, "cust-pro");
    let basic_request = entry_request(&journey, "cust-basic");
    h.put_active(journey).await;

    h.add_customer(CustomerSnapshot::new("cust-pro").with_attribute("plan", json!("pro")))
        .await;
    h.add_customer(CustomerSnapshot::new("cust-basic").with_attribute("plan", json!("free")))
        .await;

    h.processor.process(pro_request).await.unwrap();
    h.processor.process(basic_request).await.unwrap();
    h.drive().await;

    let executions = h.effects.executions();
    assert!(executions.contains(&(pro_id, "cust-pro".to_string())));
    assert!(executions.contains(&(basic_id, "cust-basic".to_string())));
    assert_eq!(executions.len(), 2);
    assert!(h.locations.is_empty());
}

#[tokio::test]
async fn test_delay_schedules_then_elapsed_advances() {
    let h = Harness::new();
    let entry = node("entry", NodeKind::Entry);
    let wait = node("wait", NodeKind::Delay { duration_secs: 3600 });
    let exit = node("exit", NodeKind::Exit);
    let wait_id = wait.id;
    let edges = vec![edge(&entry, &wait), edge(&wait, &exit)];
    let journey = Journey::new("delayed", Uuid::new_v4(), vec![entry, wait, exit], edges);
    let request = entry_request(&journey, "cust-1");
    let journey_id = h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    h.processor.process(request).await.unwrap();
    let dispositions = h.drive().await;
    assert_eq!(dispositions, vec![Disposition::Scheduled]);

    let location = h.locations.get(journey_id, "cust-1").await.unwrap().unwrap();
    assert_eq!(location.current_node_id, wait_id);
    let wake_at = location.next_scheduled_at.expect("schedule recorded");
    assert!(wake_at > location.step_entered_at);

    // What the scheduler enqueues when the delay elapses.
    let elapsed = AdvancementRequest::new(journey_id, "cust-1", wait_id, AdvanceReason::DelayElapsed);
    let disposition = h.processor.process(elapsed).await.unwrap();
    assert_eq!(disposition, Disposition::Completed);
    assert!(h.locations.is_empty());
}

#[tokio::test]
async fn test_duplicate_delivery_is_discarded() {
    let h = Harness::new();
    let (journey, send_id) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    // First delivery enters and advances past the entry node.
    h.processor.process(request.clone()).await.unwrap();
    // Redelivery of the same message: the location has moved on.
    let duplicate = h.processor.process(request).await.unwrap();
    assert_eq!(duplicate, Disposition::Discarded("stale duplicate"));

    h.drive().await;
    // The send effect still ran exactly once.
    assert_eq!(h.effects.executions(), vec![(send_id, "cust-1".to_string())]);
}

#[tokio::test]
async fn test_reentry_refused_after_completion() {
    let h = Harness::new();
    let (journey, _) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    h.processor.process(request.clone()).await.unwrap();
    h.drive().await;
    assert_eq!(h.events.count_type(EventType::JourneyCompleted), 1);

    // A second entry request after completion hits the tombstone.
    let again = h.processor.process(request).await.unwrap();
    assert_eq!(again, Disposition::Discarded("concurrent advance"));
    assert_eq!(h.effects.count(), 1);
    assert_eq!(h.events.count_type(EventType::JourneyEntered), 1);
}

#[tokio::test]
async fn test_reentry_allowed_when_configured() {
    let h = Harness::new();
    let (mut journey, _) = linear_journey();
    journey.entry_settings.allow_reentry = true;
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    h.processor.process(request.clone()).await.unwrap();
    h.drive().await;
    h.processor.process(request).await.unwrap();
    h.drive().await;

    assert_eq!(h.effects.count(), 2);
    assert_eq!(h.events.count_type(EventType::JourneyCompleted), 2);
}

#[tokio::test]
async fn test_retryable_effect_retries_then_succeeds() {
    let h = Harness::new();
    let (journey, send_id) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    for _ in 0..3 {
        h.effects.push_outcome(EffectOutcome::Retryable {
            reason: "provider 503".into(),
        });
    }

    h.processor.process(request).await.unwrap();

    // Pump one delivery at a time so each requeue's attempt is observable.
    for expected_attempt in 0..3u32 {
        let pending = h.broker.drain_all();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempt, expected_attempt);
        let disposition = h.processor.process(pending[0].clone()).await.unwrap();
        assert_eq!(disposition, Disposition::Requeued);
    }

    // The fourth delivery carries attempt 3 and the effect finally lands.
    let pending = h.broker.drain_all();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt, 3);
    let disposition = h.processor.process(pending[0].clone()).await.unwrap();
    assert_eq!(disposition, Disposition::Completed);

    assert_eq!(h.effects.count(), 4);
    assert!(h
        .effects
        .executions()
        .iter()
        .all(|(n, c)| *n == send_id && c == "cust-1"));
    assert!(h.broker.dead_letters().is_empty());
    assert!(h.locations.is_empty());
}

#[tokio::test]
async fn test_retries_exhausted_dead_letters() {
    let h = Harness::with_config(EngineConfig {
        max_attempts: 2,
        busy_requeue_ms: 1,
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
        ..EngineConfig::default()
    });
    let (journey, send_id) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    let journey_id = h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    for _ in 0..5 {
        h.effects.push_outcome(EffectOutcome::Retryable {
            reason: "provider down".into(),
        });
    }

    h.processor.process(request).await.unwrap();
    let dispositions = h.drive().await;
    assert_eq!(dispositions.last(), Some(&Disposition::DeadLettered));

    let dead = h.broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("retries exhausted"));
    assert_eq!(h.events.count_type(EventType::DeadLettered), 1);

    // The customer stays parked on the send node for operator replay.
    let location = h.locations.get(journey_id, "cust-1").await.unwrap().unwrap();
    assert_eq!(location.current_node_id, send_id);
}

#[tokio::test]
async fn test_fatal_effect_dead_letters_immediately() {
    let h = Harness::new();
    let (journey, _) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    h.effects.push_outcome(EffectOutcome::Fatal {
        reason: "template deleted".into(),
    });

    h.processor.process(request).await.unwrap();
    let dispositions = h.drive().await;
    assert_eq!(dispositions, vec![Disposition::DeadLettered]);
    assert_eq!(h.effects.count(), 1);
    assert_eq!(h.broker.dead_letters().len(), 1);
}

#[tokio::test]
async fn test_stopped_journey_discards_requests() {
    let h = Harness::new();
    let (mut journey, _) = linear_journey();
    journey.status = JourneyStatus::Stopped;
    let request = entry_request(&journey, "cust-1");
    h.journeys.put(journey).await.unwrap();
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::Discarded("journey terminal"));
    assert_eq!(h.effects.count(), 0);
    assert!(h.locations.is_empty());
}

#[tokio::test]
async fn test_pause_defers_and_resume_continues_in_place() {
    let h = Harness::new();
    let (journey, send_id) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    let journey_id = h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    // Enter and land on the send node; its follow-on is now queued.
    h.processor.process(request).await.unwrap();
    let location = h.locations.get(journey_id, "cust-1").await.unwrap().unwrap();
    assert_eq!(location.current_node_id, send_id);

    // Pause before the follow-on is processed.
    let mut journey = h.journeys.get(journey_id).await.unwrap().unwrap();
    journey.status = JourneyStatus::Paused;
    h.journeys.put(journey).await.unwrap();

    let deferred = h.broker.drain_all();
    assert_eq!(deferred.len(), 1);
    let disposition = h.processor.process(deferred[0].clone()).await.unwrap();
    assert_eq!(disposition, Disposition::Requeued);
    assert_eq!(h.effects.count(), 0);

    // Pause deferrals don't burn the attempt budget.
    let requeued = h.broker.drain_all();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].attempt, 0);

    // Resume; the deferred request picks up exactly where it stopped.
    let mut journey = h.journeys.get(journey_id).await.unwrap().unwrap();
    journey.status = JourneyStatus::Active;
    h.journeys.put(journey).await.unwrap();

    let disposition = h.processor.process(requeued[0].clone()).await.unwrap();
    assert_eq!(disposition, Disposition::Completed);
    assert_eq!(h.effects.executions(), vec![(send_id, "cust-1".to_string())]);
}

#[tokio::test]
async fn test_held_lock_requeues_with_attempt_bump() {
    let h = Harness::new();
    let (journey, _) = linear_journey();
    let request = entry_request(&journey, "cust-1");
    let journey_id = h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    // Another worker holds this customer's lease.
    let key = customer_key(journey_id, "cust-1");
    let lease = h
        .locks
        .acquire(&key, Duration::from_secs(30))
        .await
        .unwrap();

    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::Requeued);
    assert_eq!(h.effects.count(), 0);

    let requeued = h.broker.drain_all();
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].attempt, 1);

    // Once the lease is gone the requeued message goes through.
    h.locks.release(lease).await.unwrap();
    h.processor.process(requeued[0].clone()).await.unwrap();
    h.drive().await;
    assert_eq!(h.events.count_type(EventType::JourneyCompleted), 1);
}

#[tokio::test]
async fn test_overlong_delay_dead_letters_instead_of_scheduling() {
    let h = Harness::new();
    let entry = node("entry", NodeKind::Entry);
    let wait = node(
        "wait",
        NodeKind::Delay {
            duration_secs: 10_000_000_000_000_000,
        },
    );
    let exit = node("exit", NodeKind::Exit);
    let edges = vec![edge(&entry, &wait), edge(&wait, &exit)];
    let journey = Journey::new("forever", Uuid::new_v4(), vec![entry, wait, exit], edges);
    let request = entry_request(&journey, "cust-1");
    h.put_active(journey).await;
    h.add_customer(CustomerSnapshot::new("cust-1")).await;

    // A delay far beyond the representable wake-up range fails graph
    // validation, so the request parks on the dead-letter path.
    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::DeadLettered);

    let dead = h.broker.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].reason.contains("Malformed graph"));
    assert!(h.locations.is_empty());
}

#[tokio::test]
async fn test_missing_journey_discards() {
    let h = Harness::new();
    let request = AdvancementRequest::new(
        Uuid::new_v4(),
        "cust-1",
        Uuid::new_v4(),
        AdvanceReason::Entry,
    );
    let disposition = h.processor.process(request).await.unwrap();
    assert_eq!(disposition, Disposition::Discarded("journey not found"));
}

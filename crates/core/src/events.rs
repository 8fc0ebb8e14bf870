//! Analytics event sink — trait for emitting journey events from any module.
//!
//! The engine accepts an `Arc<dyn EventSink>` and reports entries, step
//! completions, dead letters and lifecycle transitions into whatever
//! analytics pipeline the deployment wires up.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kinds of events emitted by the execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JourneyEntered,
    StepCompleted,
    JourneyCompleted,
    DeadLettered,
    JourneyStarted,
    JourneyPaused,
    JourneyResumed,
    JourneyStopped,
    JourneyDeleted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub journey_id: Uuid,
    pub customer_id: Option<String>,
    pub node_id: Option<Uuid>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting journey events. Implementations route events to the
/// analytics pipeline; this core only defines the seam.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JourneyEvent);
}

/// No-op sink for deployments and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: JourneyEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<JourneyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<JourneyEvent> {
        self.events.lock().expect("event sink mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event sink mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event sink mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event sink mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: JourneyEvent) {
        self.events.lock().expect("event sink mutex poisoned").push(event);
    }
}

/// Convenience builder for creating a `JourneyEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    journey_id: Uuid,
    customer_id: Option<String>,
    node_id: Option<Uuid>,
) -> JourneyEvent {
    JourneyEvent {
        event_id: Uuid::new_v4(),
        event_type,
        journey_id,
        customer_id,
        node_id,
        detail: None,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

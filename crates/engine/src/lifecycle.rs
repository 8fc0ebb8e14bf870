//! Journey lifecycle controller — the only writer of journey status.
//!
//! Every transition runs under the journey's lifecycle lock, bumps
//! `status_version`, stamps the matching timestamp, and emits the matching
//! event. Invalid transitions fail with `Conflict` so callers can distinguish
//! "already there" from "not allowed from here".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use voyage_core::events::{make_event, EventSink, EventType};
use voyage_core::types::{Journey, JourneyStatus};
use voyage_core::{EngineError, EngineResult};
use voyage_graph::JourneyGraph;
use voyage_locks::{lifecycle_key, LockManager};
use voyage_store::{JourneyStore, LocationStore};

pub struct LifecycleController {
    journeys: Arc<dyn JourneyStore>,
    locations: Arc<dyn LocationStore>,
    locks: Arc<dyn LockManager>,
    events: Arc<dyn EventSink>,
    lease: Duration,
}

impl LifecycleController {
    pub fn new(
        journeys: Arc<dyn JourneyStore>,
        locations: Arc<dyn LocationStore>,
        locks: Arc<dyn LockManager>,
        events: Arc<dyn EventSink>,
        lease: Duration,
    ) -> Self {
        Self {
            journeys,
            locations,
            locks,
            events,
            lease,
        }
    }

    /// Draft -> Active. Validates the graph before anything goes live; a
    /// journey that fails validation stays in Draft.
    pub async fn start(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
    ) -> EngineResult<Journey> {
        self.transition(journey_id, changer, |journey| {
            if journey.status != JourneyStatus::Draft {
                return Err(invalid_transition(journey, "start"));
            }
            JourneyGraph::build(journey)?;
            journey.status = JourneyStatus::Active;
            journey.started_at = Some(Utc::now());
            Ok(EventType::JourneyStarted)
        })
        .await
    }

    /// Active -> Paused. In-flight steps finish; queued requests defer until
    /// resume.
    pub async fn pause(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
    ) -> EngineResult<Journey> {
        self.transition(journey_id, changer, |journey| {
            if journey.status != JourneyStatus::Active {
                return Err(invalid_transition(journey, "pause"));
            }
            journey.status = JourneyStatus::Paused;
            journey.latest_pause = Some(Utc::now());
            Ok(EventType::JourneyPaused)
        })
        .await
    }

    /// Paused -> Active. Customers pick up exactly where they stopped.
    pub async fn resume(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
    ) -> EngineResult<Journey> {
        self.transition(journey_id, changer, |journey| {
            if journey.status != JourneyStatus::Paused {
                return Err(invalid_transition(journey, "resume"));
            }
            journey.status = JourneyStatus::Active;
            Ok(EventType::JourneyResumed)
        })
        .await
    }

    /// Active or Paused -> Stopped. Terminal for execution; locations are
    /// kept for audit but no request will advance them again.
    pub async fn stop(&self, journey_id: Uuid, changer: Option<String>) -> EngineResult<Journey> {
        self.transition(journey_id, changer, |journey| {
            if !matches!(
                journey.status,
                JourneyStatus::Active | JourneyStatus::Paused
            ) {
                return Err(invalid_transition(journey, "stop"));
            }
            journey.status = JourneyStatus::Stopped;
            journey.stopped_at = Some(Utc::now());
            Ok(EventType::JourneyStopped)
        })
        .await
    }

    /// Any non-deleted state -> Deleted. Tombstones every location so the
    /// journey's customers drop out of scheduler scans.
    pub async fn delete(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
    ) -> EngineResult<Journey> {
        let journey = self
            .transition(journey_id, changer, |journey| {
                if journey.status == JourneyStatus::Deleted {
                    return Err(invalid_transition(journey, "delete"));
                }
                journey.status = JourneyStatus::Deleted;
                journey.deleted_at = Some(Utc::now());
                Ok(EventType::JourneyDeleted)
            })
            .await?;

        let removed = self.locations.tombstone_journey(journey_id).await?;
        info!(journey_id = %journey_id, removed = removed, "Journey locations tombstoned");
        Ok(journey)
    }

    async fn transition<F>(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
        apply: F,
    ) -> EngineResult<Journey>
    where
        F: FnOnce(&mut Journey) -> EngineResult<EventType>,
    {
        let key = lifecycle_key(journey_id);
        let lease = self.locks.acquire(&key, self.lease).await?;

        let result = self.transition_locked(journey_id, changer, apply).await;

        if let Err(e) = self.locks.release(lease).await {
            warn!(error = %e, key = %key, "Failed to release lifecycle lease");
        }
        result
    }

    async fn transition_locked<F>(
        &self,
        journey_id: Uuid,
        changer: Option<String>,
        apply: F,
    ) -> EngineResult<Journey>
    where
        F: FnOnce(&mut Journey) -> EngineResult<EventType>,
    {
        let mut journey = self
            .journeys
            .get(journey_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("journey {journey_id}")))?;

        let from = journey.status;
        let event_type = apply(&mut journey)?;
        journey.status_version += 1;
        journey.latest_changer = changer;

        self.journeys.put(journey.clone()).await?;

        info!(
            journey_id = %journey_id,
            from = ?from,
            to = ?journey.status,
            status_version = journey.status_version,
            "Journey lifecycle transition"
        );
        metrics::counter!("lifecycle.transitions").increment(1);
        self.events
            .emit(make_event(event_type, journey_id, None, None));

        Ok(journey)
    }
}

fn invalid_transition(journey: &Journey, op: &str) -> EngineError {
    EngineError::Conflict(format!(
        "cannot {op} journey {} from status {:?}",
        journey.id, journey.status
    ))
}

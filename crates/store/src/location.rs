use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::debug;
use uuid::Uuid;

use voyage_core::types::JourneyLocation;
use voyage_core::{EngineError, EngineResult};

/// Durable record of each customer's current node, with claim metadata.
///
/// `compare_and_move` is the optimistic-concurrency backstop layered under
/// the distributed lease: it fails with `Conflict` when the stored node no
/// longer matches the expected one, so even an expired-and-reused lease
/// cannot produce a double advance. Both checks must hold independently.
#[async_trait]
pub trait LocationStore: Send + Sync {
    async fn get(
        &self,
        journey_id: Uuid,
        customer_id: &str,
    ) -> EngineResult<Option<JourneyLocation>>;

    /// Creates the location at the entry node. Fails with `Conflict` when a
    /// location already exists, or when the customer previously exited and
    /// the journey does not allow re-entry.
    async fn create(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        entry_node_id: Uuid,
        allow_reentry: bool,
    ) -> EngineResult<JourneyLocation>;

    /// Atomically moves the customer from `from` to `to`. Fails with
    /// `Conflict` if the stored node is no longer `from`. Clears any pending
    /// schedule and stamps the new step entry time.
    async fn compare_and_move(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        from: Uuid,
        to: Uuid,
    ) -> EngineResult<JourneyLocation>;

    /// Records when the scheduler should wake this customer. Fails with
    /// `Conflict` if the customer is no longer at `node_id`.
    async fn schedule(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        node_id: Uuid,
        at: DateTime<Utc>,
    ) -> EngineResult<()>;

    /// Mirrors the active lease onto the row for observability.
    async fn set_claim(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<()>;

    async fn clear_claim(&self, journey_id: Uuid, customer_id: &str) -> EngineResult<()>;

    /// Removes the row and remembers the exit so non-reentrant journeys can
    /// refuse re-entry.
    async fn tombstone(&self, journey_id: Uuid, customer_id: &str) -> EngineResult<()>;

    /// Tombstones every location in a journey (journey deletion). Returns
    /// how many were removed.
    async fn tombstone_journey(&self, journey_id: Uuid) -> EngineResult<u64>;

    /// Locations whose `next_scheduled_at` has elapsed, for the scheduler
    /// scan. May return the same location on consecutive scans until the
    /// advance clears the schedule; downstream idempotency absorbs that.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<JourneyLocation>>;
}

type LocationKey = (Uuid, String);

/// DashMap-backed store for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryLocationStore {
    locations: DashMap<LocationKey, JourneyLocation>,
    exited: DashSet<LocationKey>,
}

impl MemoryLocationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[async_trait]
impl LocationStore for MemoryLocationStore {
    async fn get(
        &self,
        journey_id: Uuid,
        customer_id: &str,
    ) -> EngineResult<Option<JourneyLocation>> {
        Ok(self
            .locations
            .get(&(journey_id, customer_id.to_string()))
            .map(|r| r.clone()))
    }

    async fn create(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        entry_node_id: Uuid,
        allow_reentry: bool,
    ) -> EngineResult<JourneyLocation> {
        let key = (journey_id, customer_id.to_string());
        if !allow_reentry && self.exited.contains(&key) {
            return Err(EngineError::Conflict(format!(
                "customer {customer_id} already exited journey {journey_id}"
            )));
        }

        let location = JourneyLocation {
            journey_id,
            customer_id: customer_id.to_string(),
            current_node_id: entry_node_id,
            step_entered_at: Utc::now(),
            claimed_by: None,
            claim_expires_at: None,
            move_started_at: None,
            next_scheduled_at: None,
        };

        match self.locations.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(EngineError::Conflict(format!(
                "location already exists for {customer_id} in journey {journey_id}"
            ))),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(location.clone());
                debug!(journey_id = %journey_id, customer_id = %customer_id, "Location created");
                Ok(location)
            }
        }
    }

    async fn compare_and_move(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        from: Uuid,
        to: Uuid,
    ) -> EngineResult<JourneyLocation> {
        let key = (journey_id, customer_id.to_string());
        let mut entry = self.locations.get_mut(&key).ok_or_else(|| {
            EngineError::NotFound(format!(
                "no location for {customer_id} in journey {journey_id}"
            ))
        })?;

        if entry.current_node_id != from {
            metrics::counter!("store.move_conflicts").increment(1);
            return Err(EngineError::Conflict(format!(
                "expected {from}, found {} for {customer_id}",
                entry.current_node_id
            )));
        }

        entry.current_node_id = to;
        entry.step_entered_at = Utc::now();
        entry.move_started_at = None;
        entry.next_scheduled_at = None;
        Ok(entry.clone())
    }

    async fn schedule(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        node_id: Uuid,
        at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let key = (journey_id, customer_id.to_string());
        let mut entry = self.locations.get_mut(&key).ok_or_else(|| {
            EngineError::NotFound(format!(
                "no location for {customer_id} in journey {journey_id}"
            ))
        })?;
        if entry.current_node_id != node_id {
            return Err(EngineError::Conflict(format!(
                "cannot schedule {customer_id} at {node_id}: currently at {}",
                entry.current_node_id
            )));
        }
        entry.next_scheduled_at = Some(at);
        Ok(())
    }

    async fn set_claim(
        &self,
        journey_id: Uuid,
        customer_id: &str,
        worker: &str,
        expires_at: DateTime<Utc>,
    ) -> EngineResult<()> {
        let key = (journey_id, customer_id.to_string());
        if let Some(mut entry) = self.locations.get_mut(&key) {
            entry.claimed_by = Some(worker.to_string());
            entry.claim_expires_at = Some(expires_at);
            entry.move_started_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn clear_claim(&self, journey_id: Uuid, customer_id: &str) -> EngineResult<()> {
        let key = (journey_id, customer_id.to_string());
        if let Some(mut entry) = self.locations.get_mut(&key) {
            entry.claimed_by = None;
            entry.claim_expires_at = None;
            entry.move_started_at = None;
        }
        Ok(())
    }

    async fn tombstone(&self, journey_id: Uuid, customer_id: &str) -> EngineResult<()> {
        let key = (journey_id, customer_id.to_string());
        self.locations.remove(&key);
        self.exited.insert(key);
        debug!(journey_id = %journey_id, customer_id = %customer_id, "Location tombstoned");
        Ok(())
    }

    async fn tombstone_journey(&self, journey_id: Uuid) -> EngineResult<u64> {
        let keys: Vec<LocationKey> = self
            .locations
            .iter()
            .filter(|r| r.key().0 == journey_id)
            .map(|r| r.key().clone())
            .collect();
        let count = keys.len() as u64;
        for key in keys {
            self.locations.remove(&key);
            self.exited.insert(key);
        }
        Ok(count)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> EngineResult<Vec<JourneyLocation>> {
        let mut due: Vec<JourneyLocation> = self
            .locations
            .iter()
            .filter(|r| r.next_scheduled_at.map_or(false, |at| at <= now))
            .map(|r| r.clone())
            .collect();
        due.sort_by_key(|l| l.next_scheduled_at);
        due.truncate(limit);
        Ok(due)
    }
}

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use voyage_core::types::Journey;
use voyage_core::EngineResult;

/// Read/write access to journey definitions. The engine reads lifecycle
/// state through this seam optimistically, once per advancement attempt.
#[async_trait]
pub trait JourneyStore: Send + Sync {
    async fn get(&self, journey_id: Uuid) -> EngineResult<Option<Journey>>;

    /// Upserts the definition, stamping `latest_save`.
    async fn put(&self, journey: Journey) -> EngineResult<()>;

    async fn list(&self) -> EngineResult<Vec<Journey>>;
}

/// DashMap-backed registry for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryJourneyStore {
    journeys: DashMap<Uuid, Journey>,
}

impl MemoryJourneyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JourneyStore for MemoryJourneyStore {
    async fn get(&self, journey_id: Uuid) -> EngineResult<Option<Journey>> {
        Ok(self.journeys.get(&journey_id).map(|r| r.clone()))
    }

    async fn put(&self, mut journey: Journey) -> EngineResult<()> {
        journey.latest_save = Utc::now();
        info!(journey_id = %journey.id, name = %journey.name, status = ?journey.status, "Saving journey");
        self.journeys.insert(journey.id, journey);
        Ok(())
    }

    async fn list(&self) -> EngineResult<Vec<Journey>> {
        Ok(self.journeys.iter().map(|r| r.value().clone()).collect())
    }
}

use async_trait::async_trait;
use dashmap::DashMap;

use voyage_core::types::CustomerSnapshot;
use voyage_core::EngineResult;

/// Read-only view into the external customer attribute store. The engine
/// never owns customer lifecycle; it only reads snapshots for criteria
/// evaluation.
#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn snapshot(&self, customer_id: &str) -> EngineResult<Option<CustomerSnapshot>>;
}

/// DashMap-backed snapshot source for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryCustomerStore {
    customers: DashMap<String, CustomerSnapshot>,
}

impl MemoryCustomerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, snapshot: CustomerSnapshot) {
        self.customers.insert(snapshot.customer_id.clone(), snapshot);
    }
}

#[async_trait]
impl CustomerStore for MemoryCustomerStore {
    async fn snapshot(&self, customer_id: &str) -> EngineResult<Option<CustomerSnapshot>> {
        Ok(self.customers.get(customer_id).map(|r| r.clone()))
    }
}

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use voyage_core::EngineResult;

/// A time-bounded mutual-exclusion grant over a resource key. The token is
/// random per acquisition so a holder can never release or extend a lease it
/// no longer owns.
#[derive(Debug, Clone)]
pub struct Lease {
    pub key: String,
    pub token: String,
    pub valid_until: DateTime<Utc>,
    /// Requested lease span; renewal extends validity by this much again.
    pub ttl: Duration,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }
}

/// Mutual-exclusion lease protocol. Acquisition on a held key returns
/// `EngineError::Busy` immediately, never a blocking wait; the caller treats
/// `Busy` as "another worker is handling this resource now".
#[async_trait]
pub trait LockManager: Send + Sync {
    async fn acquire(&self, key: &str, lease: Duration) -> EngineResult<Lease>;

    /// Extends a held lease. Fails with `EngineError::LeaseExpired` once the
    /// lease has lapsed or been taken over.
    async fn renew(&self, lease: &Lease) -> EngineResult<Lease>;

    async fn release(&self, lease: Lease) -> EngineResult<()>;
}

/// Lease key for step processing of one customer in one journey.
pub fn customer_key(journey_id: Uuid, customer_id: &str) -> String {
    format!("journey:{journey_id}:customer:{customer_id}")
}

/// Lease key for journey-level lifecycle operations. Separate namespace so
/// stop/delete serialize against each other without touching per-customer
/// leases.
pub fn lifecycle_key(journey_id: Uuid) -> String {
    format!("journey:{journey_id}:lifecycle")
}

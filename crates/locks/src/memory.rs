//! In-process lock manager with the same semantics as the Redis quorum
//! implementation. Used by tests and single-node deployments.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;

use voyage_core::{EngineError, EngineResult};

use crate::manager::{Lease, LockManager};

#[derive(Debug, Clone)]
struct Held {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryLockManager {
    held: DashMap<String, Held>,
}

impl MemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(22)
        .map(char::from)
        .collect()
}

fn to_chrono(lease: Duration) -> EngineResult<chrono::Duration> {
    chrono::Duration::from_std(lease)
        .map_err(|e| EngineError::Lock(format!("lease duration out of range: {e}")))
}

#[async_trait]
impl LockManager for MemoryLockManager {
    async fn acquire(&self, key: &str, lease: Duration) -> EngineResult<Lease> {
        let now = Utc::now();
        let expires_at = now + to_chrono(lease)?;
        let token = new_token();

        match self.held.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    metrics::counter!("locks.busy").increment(1);
                    return Err(EngineError::Busy(format!("lease held on {key}")));
                }
                // Previous holder lapsed; take over.
                occupied.insert(Held {
                    token: token.clone(),
                    expires_at,
                });
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Held {
                    token: token.clone(),
                    expires_at,
                });
            }
        }

        metrics::counter!("locks.acquired").increment(1);
        Ok(Lease {
            key: key.to_string(),
            token,
            valid_until: expires_at,
            ttl: lease,
        })
    }

    async fn renew(&self, lease: &Lease) -> EngineResult<Lease> {
        let now = Utc::now();
        let expires_at = now + to_chrono(lease.ttl)?;

        let mut entry = self
            .held
            .get_mut(&lease.key)
            .ok_or_else(|| EngineError::LeaseExpired(format!("no lease held on {}", lease.key)))?;
        if entry.token != lease.token || entry.expires_at <= now {
            return Err(EngineError::LeaseExpired(format!(
                "lease on {} no longer owned",
                lease.key
            )));
        }
        entry.expires_at = expires_at;

        metrics::counter!("locks.renewed").increment(1);
        Ok(Lease {
            key: lease.key.clone(),
            token: lease.token.clone(),
            valid_until: expires_at,
            ttl: lease.ttl,
        })
    }

    async fn release(&self, lease: Lease) -> EngineResult<()> {
        self.held
            .remove_if(&lease.key, |_, held| held.token == lease.token);
        Ok(())
    }
}

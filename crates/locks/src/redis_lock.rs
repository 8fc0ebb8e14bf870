//! Quorum lease manager over N independent Redis endpoints.
//!
//! A lease is held only when a strict majority of endpoints accepted the
//! token, and its validity is the requested span minus acquisition time and
//! a clock-drift allowance. A single endpoint failure therefore cannot cause
//! two workers to simultaneously believe they hold the same lease. Release
//! and renew compare the token server-side so a worker can never touch a
//! lease it no longer owns.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};

use voyage_core::config::RedisConfig;
use voyage_core::{EngineError, EngineResult};

use crate::manager::{Lease, LockManager};

const RELEASE_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('pexpire', KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLockManager {
    clients: Vec<redis::Client>,
    release_script: redis::Script,
    renew_script: redis::Script,
}

/// Strict majority for `n` endpoints.
pub fn quorum(n: usize) -> usize {
    n / 2 + 1
}

/// Allowance for clock drift between lock endpoints: 1% of the lease plus a
/// constant floor, per the standard multi-node lease protocol.
fn drift_allowance(lease: Duration) -> Duration {
    lease / 100 + Duration::from_millis(2)
}

impl RedisLockManager {
    /// Connects to every configured endpoint. Endpoints that fail the
    /// initial ping are still kept; quorum math tolerates them being down.
    pub async fn new(config: &RedisConfig) -> EngineResult<Self> {
        if config.urls.is_empty() {
            return Err(EngineError::Lock("no Redis lock endpoints configured".into()));
        }

        let mut clients = Vec::with_capacity(config.urls.len());
        for url in &config.urls {
            info!(url = %url, "Connecting to Redis lock endpoint");
            let client = redis::Client::open(url.as_str())
                .map_err(|e| EngineError::Lock(format!("invalid Redis URL {url}: {e}")))?;

            match client.get_multiplexed_async_connection().await {
                Ok(mut conn) => {
                    let pong: Result<String, _> =
                        redis::cmd("PING").query_async(&mut conn).await;
                    match pong {
                        Ok(response) => debug!(url = %url, response = %response, "Lock endpoint reachable"),
                        Err(e) => warn!(url = %url, error = %e, "Lock endpoint ping failed"),
                    }
                }
                Err(e) => warn!(url = %url, error = %e, "Lock endpoint unreachable at startup"),
            }

            clients.push(client);
        }

        info!(
            endpoints = clients.len(),
            quorum = quorum(clients.len()),
            "Redis lock manager ready"
        );

        Ok(Self {
            clients,
            release_script: redis::Script::new(RELEASE_SCRIPT),
            renew_script: redis::Script::new(RENEW_SCRIPT),
        })
    }

    fn new_token() -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(22)
            .map(char::from)
            .collect()
    }

    async fn try_set(&self, client: &redis::Client, key: &str, token: &str, ttl_ms: u64) -> bool {
        let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
            return false;
        };
        let result: Result<Option<String>, _> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;
        matches!(result, Ok(Some(_)))
    }

    /// Best-effort removal of the token from every endpoint.
    async fn unlock_all(&self, key: &str, token: &str) {
        for client in &self.clients {
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                let _: Result<i64, _> = self
                    .release_script
                    .key(key)
                    .arg(token)
                    .invoke_async(&mut conn)
                    .await;
            }
        }
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, lease: Duration) -> EngineResult<Lease> {
        let token = Self::new_token();
        let ttl_ms = lease.as_millis() as u64;
        let started = Instant::now();

        let mut acquired = 0usize;
        for client in &self.clients {
            if self.try_set(client, key, &token, ttl_ms).await {
                acquired += 1;
            }
        }

        let elapsed = started.elapsed();
        let margin = elapsed + drift_allowance(lease);

        if acquired >= quorum(self.clients.len()) && lease > margin {
            let validity = lease - margin;
            metrics::counter!("locks.acquired").increment(1);
            debug!(key = %key, acquired, validity_ms = validity.as_millis() as u64, "Lease acquired");
            Ok(Lease {
                key: key.to_string(),
                token,
                valid_until: Utc::now()
                    + chrono::Duration::from_std(validity)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                ttl: lease,
            })
        } else {
            // Lost the quorum race (or spent the lease acquiring it); leave
            // nothing behind.
            self.unlock_all(key, &token).await;
            metrics::counter!("locks.busy").increment(1);
            Err(EngineError::Busy(format!(
                "quorum not reached for {key} ({acquired}/{})",
                self.clients.len()
            )))
        }
    }

    async fn renew(&self, lease: &Lease) -> EngineResult<Lease> {
        let ttl_ms = lease.ttl.as_millis() as u64;
        let started = Instant::now();

        let mut renewed = 0usize;
        for client in &self.clients {
            if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                let extended: Result<i64, _> = self
                    .renew_script
                    .key(&lease.key)
                    .arg(&lease.token)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn)
                    .await;
                if matches!(extended, Ok(1)) {
                    renewed += 1;
                }
            }
        }

        if renewed >= quorum(self.clients.len()) {
            let margin = started.elapsed() + drift_allowance(lease.ttl);
            let validity = lease.ttl.saturating_sub(margin);
            metrics::counter!("locks.renewed").increment(1);
            Ok(Lease {
                key: lease.key.clone(),
                token: lease.token.clone(),
                valid_until: Utc::now()
                    + chrono::Duration::from_std(validity)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
                ttl: lease.ttl,
            })
        } else {
            metrics::counter!("locks.renew_lost").increment(1);
            Err(EngineError::LeaseExpired(format!(
                "renew quorum not reached for {} ({renewed}/{})",
                lease.key,
                self.clients.len()
            )))
        }
    }

    async fn release(&self, lease: Lease) -> EngineResult<()> {
        self.unlock_all(&lease.key, &lease.token).await;
        Ok(())
    }
}

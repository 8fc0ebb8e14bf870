//! Distributed lock manager — time-bounded mutual-exclusion leases keyed by
//! (journey, customer), with a quorum Redis implementation for multi-replica
//! deployments and an in-process implementation for tests and single nodes.

pub mod manager;
pub mod memory;
pub mod redis_lock;

pub use manager::{customer_key, lifecycle_key, Lease, LockManager};
pub use memory::MemoryLockManager;
pub use redis_lock::RedisLockManager;

//! Persistence seams for the execution engine: journey locations (the
//! mutable heart of the system), journey definitions, and read-only customer
//! snapshots. Each trait ships with an in-memory implementation used by
//! tests and single-node deployments; the relational implementations live
//! with the deployment.

pub mod customer;
pub mod journey;
pub mod location;

pub use customer::{CustomerStore, MemoryCustomerStore};
pub use journey::{JourneyStore, MemoryJourneyStore};
pub use location::{LocationStore, MemoryLocationStore};

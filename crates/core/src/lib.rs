//! Shared foundation for the Voyage journey execution engine: data model,
//! error taxonomy, configuration, and the analytics event sink.

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use error::{EngineError, EngineResult};

use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// The journey graph failed validation. Fatal for that journey until the
    /// definition is corrected; never retried.
    #[error("Malformed graph: {0}")]
    MalformedGraph(String),

    /// Another worker holds the lease. Expected contention signal, not a
    /// failure; the caller requeues with backoff.
    #[error("Resource busy: {0}")]
    Busy(String),

    /// The stored position no longer matches the expected node. Another
    /// advance already happened; the caller discards the message.
    #[error("Conflicting move: {0}")]
    Conflict(String),

    /// Journey, customer or location vanished mid-flight.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A lease could not be renewed because it already lapsed.
    #[error("Lease expired: {0}")]
    LeaseExpired(String),

    #[error("Lock backend error: {0}")]
    Lock(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Expected concurrency outcomes that are counted and dropped rather
    /// than reported as failures.
    pub fn is_expected_race(&self) -> bool {
        matches!(self, EngineError::Busy(_) | EngineError::Conflict(_))
    }
}

//! Shared store error type for presence and route backends.

use thiserror::Error;

/// Errors surfaced by presence and route stores.
///
/// Callers in the connection hot path log and swallow write errors (a user
/// appearing offline during a store outage is acceptable degraded
/// behavior); read errors must propagate so stale data is never mislabeled
/// as fresh.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store is unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backing store rejected the operation.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored record could not be (de)serialized.
    #[error("Record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

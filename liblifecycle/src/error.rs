use common::TileableKey;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LifecycleError {
    #[error("tileable {0} not tracked before")]
    NotTracked(TileableKey),

    /// More decrefs than increfs for `key`.
    #[error("reference count of {key} would go negative (at {current}, minus {requested})")]
    RefCountUnderflow {
        key: String,
        current: u64,
        requested: u64,
    },

    #[error("lifecycle tracker {0} does not exist")]
    UnknownTracker(String),

    #[error("lifecycle tracker {0} has stopped")]
    Closed(String),
}

use std::time::Duration;

use common::{DataError, RemoteError, TileableKey};
use liblifecycle::LifecycleError;
use libstorage::{MetaError, StorageError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The remote computation raised; `source` keeps its kind, message and traceback.
    #[error("task {task_id} failed: {source}")]
    ExecutionFailed {
        task_id: String,
        #[source]
        source: RemoteError,
    },

    #[error("Cannot fetch unexecuted tileable: {0}")]
    NotExecuted(TileableKey),

    #[error("Only support fetch data slices, got {0}")]
    UnsupportedFetch(String),

    #[error("session {0} does not exist")]
    UnknownSession(String),

    #[error("session {0} is already destroyed")]
    Closed(String),

    #[error("task {task_id} did not finish within {timeout:?}")]
    Timeout { task_id: String, timeout: Duration },

    #[error("watching task {0} was cancelled")]
    Cancelled(String),

    #[error("task service error: {0}")]
    Service(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Data(#[from] DataError),
}

impl SessionError {
    /// Remote exception behind an execution failure.
    pub fn remote_cause(&self) -> Option<&RemoteError> {
        match self {
            SessionError::ExecutionFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

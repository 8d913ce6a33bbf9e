//! Client side of the engine: a [`Session`] submits tileable graphs, watches
//! their tasks, fetches materialized results and releases them again.

pub mod api;
pub mod error;
pub mod execution;
pub mod fetch;
pub mod handle;
pub mod session;

pub use api::{SessionApi, SessionHandles, TaskApi};
pub use error::SessionError;
pub use execution::{ExecuteOptions, ExecutionInfo, ExecutionState};
pub use fetch::StorageRoute;
pub use handle::{HandleRegistry, TileableHandle};
pub use session::{Session, SessionConfig};

//! Lifecycle tracking of tileables and chunks.
//!
//! One tracker runs per session as a tokio task. Every request goes through
//! [`LifecycleApi`], which serializes them into the tracker's mailbox, so the
//! reference count tables never see interleaved updates.

mod actor;
pub mod error;
pub mod gc;
pub mod service;
pub mod state;

pub use actor::{DeletionHandle, LifecycleApi, spawn_tracker};
pub use error::LifecycleError;
pub use gc::{ChunkRemover, DeletionReport};
pub use service::{LifecycleService, gen_uid};
pub use state::TrackerState;

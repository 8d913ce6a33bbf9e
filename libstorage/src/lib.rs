//! Storage access for chunk data.
//!
//! Responsibilities:
//! - `api`: the `StorageApi` contract (get / put / delete addressed by key and
//!   an explicit node).
//! - `node`: per-node tiered storage (memory, optional disk) namespaced by session.
//! - `direct`: in-cluster access that talks to the owning node directly.
//! - `web`: the same contract tunnelled over HTTP for callers outside the cluster.
//! - `cache`: per-process caches of access handles and chunk locations.
//! - `meta`: the metadata directory mapping chunk keys to their bands.

pub mod api;
pub mod cache;
pub mod direct;
pub mod error;
pub mod meta;
pub mod node;
pub mod web;

pub use api::{StorageApi, StorageConnector};
pub use cache::{LocationCache, StorageApiCache};
pub use direct::{ClusterDirectory, DirectStorageApi};
pub use error::{MetaError, StorageError};
pub use meta::{InMemoryMetaApi, MetaApi, MetaService};
pub use node::{NodeStorage, NodeStorageConfig};
pub use web::client::{WebConnector, WebStorageApi};
pub use web::handler::{TunnelState, create_router};

//! Shared definitions for the rk8s compute engine.
//!
//! Every other member of the workspace speaks in terms of the types defined
//! here: tileable and chunk keys, bands, storage levels, chunk metadata, the
//! dense tensor value stored per chunk, and the client-side tileable graph that
//! a session submits to the task service.

pub mod codec;
pub mod data;
pub mod error;
pub mod graph;
pub mod task;
pub mod tensor;
pub mod types;

pub use data::{ChunkData, ChunkIndex, merge_chunks};
pub use error::DataError;
pub use graph::{
    Chunk, FetchTileable, GraphNode, Operand, Tileable, TileableGraph, TileableParams, tokenize,
};
pub use task::{RemoteError, TaskResult};
pub use tensor::{IndexItem, Tensor};
pub use types::{
    Band, ChunkKey, ChunkMeta, DEFAULT_DEVICE, DataInfo, ErrorMode, MetaFields, StorageLevel,
    TileableKey, new_session_id,
};

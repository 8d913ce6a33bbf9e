use std::sync::Arc;

use async_trait::async_trait;
use common::{ChunkData, ChunkKey, DataInfo, ErrorMode, IndexItem, StorageLevel};

use crate::error::StorageError;

/// Access to the data of one session on one node.
///
/// Implementations are stateless proxies, so handles can be cached per
/// `(session, node)` pair.
#[async_trait]
pub trait StorageApi: Send + Sync {
    /// Reads `key`. `conditions` selects a sub-range; `None` reads the whole object.
    async fn get(
        &self,
        key: &ChunkKey,
        conditions: Option<&[IndexItem]>,
    ) -> Result<ChunkData, StorageError>;

    async fn put(
        &self,
        key: &ChunkKey,
        value: ChunkData,
        level: StorageLevel,
    ) -> Result<DataInfo, StorageError>;

    /// With `ErrorMode::Ignore` a missing key counts as deleted.
    async fn delete(&self, key: &ChunkKey, error: ErrorMode) -> Result<(), StorageError>;

    /// Deletes several keys in one call. A failure on one key does not stop
    /// the others; outcomes are returned in input order.
    async fn delete_batch(
        &self,
        keys: &[ChunkKey],
        error: ErrorMode,
    ) -> Vec<Result<(), StorageError>> {
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            outcomes.push(self.delete(key, error).await);
        }
        outcomes
    }

    /// Keys held for this session on the node, for diagnostics.
    async fn list(&self) -> Result<Vec<ChunkKey>, StorageError>;
}

/// Builds storage handles for a `(session, node address)` pair.
pub trait StorageConnector: Send + Sync {
    fn connect(
        &self,
        session_id: &str,
        address: &str,
    ) -> Result<Arc<dyn StorageApi>, StorageError>;
}

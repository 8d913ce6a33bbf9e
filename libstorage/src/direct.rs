use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ChunkData, ChunkKey, DataInfo, ErrorMode, IndexItem, StorageLevel};

use crate::api::{StorageApi, StorageConnector};
use crate::error::StorageError;
use crate::node::NodeStorage;

/// Address book of the storage nodes reachable from inside the cluster.
#[derive(Default)]
pub struct ClusterDirectory {
    nodes: HashMap<String, Arc<NodeStorage>>,
}

impl ClusterDirectory {
    pub fn new(nodes: impl IntoIterator<Item = Arc<NodeStorage>>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.address().to_string(), n))
                .collect(),
        }
    }

    pub fn node(&self, address: &str) -> Result<Arc<NodeStorage>, StorageError> {
        self.nodes
            .get(address)
            .cloned()
            .ok_or_else(|| StorageError::UnknownNode(address.to_string()))
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.nodes.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl StorageConnector for ClusterDirectory {
    fn connect(
        &self,
        session_id: &str,
        address: &str,
    ) -> Result<Arc<dyn StorageApi>, StorageError> {
        let node = self.node(address)?;
        Ok(Arc::new(DirectStorageApi::new(session_id, node)))
    }
}

/// Talks to the owning node without leaving the process.
pub struct DirectStorageApi {
    session_id: String,
    node: Arc<NodeStorage>,
}

impl DirectStorageApi {
    pub fn new(session_id: impl Into<String>, node: Arc<NodeStorage>) -> Self {
        Self {
            session_id: session_id.into(),
            node,
        }
    }

    pub fn address(&self) -> &str {
        self.node.address()
    }
}

#[async_trait]
impl StorageApi for DirectStorageApi {
    async fn get(
        &self,
        key: &ChunkKey,
        conditions: Option<&[IndexItem]>,
    ) -> Result<ChunkData, StorageError> {
        self.node.get(&self.session_id, key, conditions).await
    }

    async fn put(
        &self,
        key: &ChunkKey,
        value: ChunkData,
        level: StorageLevel,
    ) -> Result<DataInfo, StorageError> {
        self.node.put(&self.session_id, key, value, level).await
    }

    async fn delete(&self, key: &ChunkKey, error: ErrorMode) -> Result<(), StorageError> {
        match self.node.delete(&self.session_id, key).await {
            Err(e) if e.is_not_found() && error == ErrorMode::Ignore => Ok(()),
            other => other,
        }
    }

    async fn list(&self) -> Result<Vec<ChunkKey>, StorageError> {
        Ok(self.node.keys(&self.session_id).await)
    }
}

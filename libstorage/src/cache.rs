use std::sync::Arc;
use std::time::Duration;

use common::{Band, ChunkKey};
use moka::future::Cache;
use tracing::debug;

use crate::api::{StorageApi, StorageConnector};
use crate::error::StorageError;

/// Storage handles keyed by `(session_id, address)`.
///
/// Handles hold no per-request state, so reusing them is always safe.
pub struct StorageApiCache {
    connector: Arc<dyn StorageConnector>,
    handles: Cache<(String, String), Arc<dyn StorageApi>>,
}

impl StorageApiCache {
    pub fn new(connector: Arc<dyn StorageConnector>, capacity: u64) -> Self {
        Self {
            connector,
            handles: Cache::builder().max_capacity(capacity).build(),
        }
    }

    pub async fn get(
        &self,
        session_id: &str,
        address: &str,
    ) -> Result<Arc<dyn StorageApi>, StorageError> {
        let key = (session_id.to_string(), address.to_string());
        if let Some(api) = self.handles.get(&key).await {
            return Ok(api);
        }
        let api = self.connector.connect(session_id, address)?;
        debug!("Connected storage of session {} on {}", session_id, address);
        self.handles.insert(key, api.clone()).await;
        Ok(api)
    }

    /// Drops every handle of `session_id`.
    pub async fn invalidate_session(&self, session_id: &str) {
        let stale: Vec<Arc<(String, String)>> = self
            .handles
            .iter()
            .filter(|(k, _)| k.0 == session_id)
            .map(|(k, _)| k)
            .collect();
        for key in stale {
            self.handles.invalidate(key.as_ref()).await;
        }
    }
}

/// Short-lived cache of chunk locations.
///
/// A cached band can outlive the chunk it points to; callers treat a
/// not-found read through a cached band as a miss and resolve again.
pub struct LocationCache {
    bands: Cache<(String, ChunkKey), Band>,
}

impl LocationCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            bands: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub async fn get(&self, session_id: &str, key: &ChunkKey) -> Option<Band> {
        self.bands
            .get(&(session_id.to_string(), key.clone()))
            .await
    }

    pub async fn insert(&self, session_id: &str, key: &ChunkKey, band: Band) {
        self.bands
            .insert((session_id.to_string(), key.clone()), band)
            .await;
    }

    pub async fn invalidate(&self, session_id: &str, key: &ChunkKey) {
        self.bands
            .invalidate(&(session_id.to_string(), key.clone()))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::direct::ClusterDirectory;
    use crate::node::{NodeStorage, NodeStorageConfig};

    #[tokio::test]
    async fn test_handles_are_reused_per_session_and_node() {
        let directory = Arc::new(ClusterDirectory::new(vec![Arc::new(NodeStorage::new(
            "n1",
            NodeStorageConfig::default(),
        ))]));
        let cache = StorageApiCache::new(directory, 16);
        let a = cache.get("s1", "n1").await.unwrap();
        let b = cache.get("s1", "n1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = cache.get("s2", "n1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &other));

        cache.invalidate_session("s1").await;
        let c = cache.get("s1", "n1").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        assert!(cache.get("s1", "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_location_entries_expire() {
        let cache = LocationCache::new(16, Duration::from_millis(50));
        let key = ChunkKey::from("k");
        cache.insert("s", &key, Band::new("n1")).await;
        assert_eq!(cache.get("s", &key).await, Some(Band::new("n1")));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(cache.get("s", &key).await, None);
    }
}

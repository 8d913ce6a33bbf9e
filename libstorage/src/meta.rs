//! Metadata directory: which bands hold each chunk and how big it is.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::{ChunkKey, ChunkMeta, ErrorMode, MetaFields};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::MetaError;

#[async_trait]
pub trait MetaApi: Send + Sync {
    async fn set_chunk_meta(&self, meta: ChunkMeta) -> Result<(), MetaError>;

    /// `None` is only returned with `ErrorMode::Ignore`.
    async fn get_chunk_meta(
        &self,
        key: &ChunkKey,
        fields: MetaFields,
        error: ErrorMode,
    ) -> Result<Option<ChunkMeta>, MetaError>;

    /// Batched lookup answered in one round trip, in input order.
    async fn get_chunk_metas(
        &self,
        keys: &[ChunkKey],
        fields: MetaFields,
        error: ErrorMode,
    ) -> Result<Vec<Option<ChunkMeta>>, MetaError>;

    /// Removing an absent entry is a no-op.
    async fn del_chunk_meta(&self, key: &ChunkKey) -> Result<(), MetaError>;

    async fn del_chunk_metas(&self, keys: &[ChunkKey]) -> Result<(), MetaError>;
}

/// Directory of one session, kept in memory.
#[derive(Default)]
pub struct InMemoryMetaApi {
    session_id: String,
    metas: RwLock<HashMap<ChunkKey, ChunkMeta>>,
}

impl InMemoryMetaApi {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            metas: RwLock::new(HashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn len(&self) -> usize {
        self.metas.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.metas.read().await.is_empty()
    }

    fn lookup(
        metas: &HashMap<ChunkKey, ChunkMeta>,
        key: &ChunkKey,
        fields: MetaFields,
        error: ErrorMode,
    ) -> Result<Option<ChunkMeta>, MetaError> {
        match metas.get(key) {
            Some(meta) => Ok(Some(meta.select(fields))),
            None if error == ErrorMode::Ignore => Ok(None),
            None => Err(MetaError::NotFound(key.clone())),
        }
    }
}

#[async_trait]
impl MetaApi for InMemoryMetaApi {
    async fn set_chunk_meta(&self, meta: ChunkMeta) -> Result<(), MetaError> {
        debug!("Set meta of {} in session {}", meta.chunk_key, self.session_id);
        self.metas
            .write()
            .await
            .insert(meta.chunk_key.clone(), meta);
        Ok(())
    }

    async fn get_chunk_meta(
        &self,
        key: &ChunkKey,
        fields: MetaFields,
        error: ErrorMode,
    ) -> Result<Option<ChunkMeta>, MetaError> {
        let metas = self.metas.read().await;
        Self::lookup(&metas, key, fields, error)
    }

    async fn get_chunk_metas(
        &self,
        keys: &[ChunkKey],
        fields: MetaFields,
        error: ErrorMode,
    ) -> Result<Vec<Option<ChunkMeta>>, MetaError> {
        let metas = self.metas.read().await;
        keys.iter()
            .map(|key| Self::lookup(&metas, key, fields, error))
            .collect()
    }

    async fn del_chunk_meta(&self, key: &ChunkKey) -> Result<(), MetaError> {
        self.metas.write().await.remove(key);
        Ok(())
    }

    async fn del_chunk_metas(&self, keys: &[ChunkKey]) -> Result<(), MetaError> {
        let mut metas = self.metas.write().await;
        for key in keys {
            metas.remove(key);
        }
        Ok(())
    }
}

/// Registry of per-session metadata directories.
#[derive(Default)]
pub struct MetaService {
    sessions: RwLock<HashMap<String, Arc<InMemoryMetaApi>>>,
}

impl MetaService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the directory of `session_id`, returning the existing one if present.
    pub async fn create_session(&self, session_id: &str) -> Arc<InMemoryMetaApi> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Created metadata directory for session {}", session_id);
                Arc::new(InMemoryMetaApi::new(session_id))
            })
            .clone()
    }

    pub async fn get(&self, session_id: &str) -> Result<Arc<InMemoryMetaApi>, MetaError> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| MetaError::UnknownSession(session_id.to_string()))
    }

    pub async fn api(&self, session_id: &str) -> Result<Arc<dyn MetaApi>, MetaError> {
        let api: Arc<dyn MetaApi> = self.get(session_id).await?;
        Ok(api)
    }

    pub async fn remove_session(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Band;

    fn meta(key: &str, addr: &str) -> ChunkMeta {
        ChunkMeta {
            chunk_key: ChunkKey::from(key),
            bands: vec![Band::new(addr)],
            memory_size: 8,
            store_size: 8,
            shape: vec![1],
            index: vec![0],
        }
    }

    #[tokio::test]
    async fn test_batched_lookup_respects_error_mode() {
        let api = InMemoryMetaApi::new("s");
        api.set_chunk_meta(meta("a", "n1")).await.unwrap();

        let keys = [ChunkKey::from("a"), ChunkKey::from("b")];
        let found = api
            .get_chunk_metas(&keys, MetaFields::BANDS, ErrorMode::Ignore)
            .await
            .unwrap();
        assert_eq!(found[0].as_ref().unwrap().bands[0].address, "n1");
        assert!(found[1].is_none());

        let err = api
            .get_chunk_metas(&keys, MetaFields::BANDS, ErrorMode::Raise)
            .await
            .unwrap_err();
        assert!(err.is_not_found());

        api.del_chunk_metas(&keys).await.unwrap();
        assert!(api.is_empty().await);
    }

    #[tokio::test]
    async fn test_service_sessions() {
        let service = MetaService::new();
        assert!(matches!(
            service.get("s").await,
            Err(MetaError::UnknownSession(_))
        ));
        let a = service.create_session("s").await;
        a.set_chunk_meta(meta("k", "n")).await.unwrap();
        let b = service.create_session("s").await;
        assert_eq!(b.len().await, 1);
        assert!(service.remove_session("s").await);
        assert!(!service.remove_session("s").await);
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use common::{
    Band, ChunkData, ErrorMode, FetchTileable, IndexItem, MetaFields, Operand, Tileable,
    TileableKey, merge_chunks,
};
use futures::future::try_join_all;
use libstorage::{MetaApi, StorageApi, StorageApiCache, StorageError, WebConnector};

use crate::error::SessionError;
use crate::execution::Executed;

const WEB_HANDLE_CAPACITY: u64 = 1024;

/// How a session reaches chunk bytes.
#[derive(Clone)]
pub enum StorageRoute {
    /// Straight to the owning node.
    Direct(Arc<StorageApiCache>),
    /// Through the HTTP tunnel of `base_url`; the server picks the node.
    Web {
        base_url: String,
        cache: Arc<StorageApiCache>,
    },
}

impl StorageRoute {
    pub fn web(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let connector = Arc::new(WebConnector::new(base_url.clone()));
        StorageRoute::Web {
            base_url,
            cache: Arc::new(StorageApiCache::new(connector, WEB_HANDLE_CAPACITY)),
        }
    }

    /// Tunnels for `http` addresses, goes direct otherwise.
    pub fn for_address(address: &str, direct: Arc<StorageApiCache>) -> Self {
        if address.starts_with("http://") || address.starts_with("https://") {
            Self::web(address)
        } else {
            StorageRoute::Direct(direct)
        }
    }

    pub fn is_web(&self) -> bool {
        matches!(self, StorageRoute::Web { .. })
    }

    fn cache(&self) -> &Arc<StorageApiCache> {
        match self {
            StorageRoute::Direct(cache) => cache,
            StorageRoute::Web { cache, .. } => cache,
        }
    }

    pub async fn storage_api(
        &self,
        session_id: &str,
        band: &Band,
    ) -> Result<Arc<dyn StorageApi>, StorageError> {
        self.cache().get(session_id, &band.address).await
    }

    pub async fn invalidate_session(&self, session_id: &str) {
        self.cache().invalidate_session(session_id).await;
    }
}

/// Finds the executed tileable behind `tileable`, following slices of
/// executed tileables. Index levels are returned innermost first.
pub(crate) fn resolve(
    tileable: &Tileable,
    executed: &HashMap<TileableKey, Executed>,
) -> Result<(FetchTileable, Vec<Vec<IndexItem>>), SessionError> {
    let mut current = tileable.clone();
    let mut levels = Vec::new();
    loop {
        if let Some(found) = executed.get(current.key()) {
            levels.reverse();
            return Ok((found.fetch.clone(), levels));
        }
        let input = match current.op() {
            Operand::Index { indexes } => {
                if let Some(bad) = indexes.iter().find(|item| !item.is_plain()) {
                    return Err(SessionError::UnsupportedFetch(format!("{bad:?}")));
                }
                levels.push(indexes.clone());
                current.inputs().first().cloned()
            }
            _ => None,
        };
        current = input.ok_or_else(|| SessionError::NotExecuted(current.key().clone()))?;
    }
}

/// Reads every chunk of `fetch` concurrently and merges them by index.
pub(crate) async fn fetch_chunks(
    session_id: &str,
    meta: &dyn MetaApi,
    route: &StorageRoute,
    fetch: &FetchTileable,
) -> Result<ChunkData, SessionError> {
    let keys = fetch.chunk_keys();
    let metas = meta
        .get_chunk_metas(&keys, MetaFields::BANDS, ErrorMode::Raise)
        .await?;
    let reads = fetch.chunks.iter().zip(metas).map(|(chunk, meta)| async move {
        let band = meta
            .and_then(|m| m.bands.into_iter().next())
            .ok_or_else(|| StorageError::NoBand(chunk.key.clone()))?;
        let api = route.storage_api(session_id, &band).await?;
        let data = api.get(&chunk.key, None).await?;
        Ok::<_, SessionError>((chunk.index.clone(), data))
    });
    let pieces = try_join_all(reads).await?;
    Ok(merge_chunks(pieces)?)
}

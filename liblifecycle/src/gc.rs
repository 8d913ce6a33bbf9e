//! Removal of released chunks from storage and the metadata directory.

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{ChunkKey, ErrorMode, MetaFields};
use futures::future::join_all;
use libstorage::{MetaApi, StorageApiCache};
use tracing::{info, warn};

/// Outcome of one deletion batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeletionReport {
    /// Keys whose data and metadata were removed.
    pub removed: Vec<ChunkKey>,
    /// Keys without metadata; already deleted or never materialized.
    pub missing: Vec<ChunkKey>,
    /// Keys whose storage deletion failed on at least one band, or whose
    /// metadata could not be deleted.
    pub failed: Vec<(ChunkKey, String)>,
}

impl DeletionReport {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.missing.is_empty() && self.failed.is_empty()
    }

    pub fn merge(&mut self, other: DeletionReport) {
        self.removed.extend(other.removed);
        self.missing.extend(other.missing);
        self.failed.extend(other.failed);
    }
}

/// Deletes chunks of one session wherever they are stored.
#[derive(Clone)]
pub struct ChunkRemover {
    session_id: String,
    meta: Arc<dyn MetaApi>,
    storage: Arc<StorageApiCache>,
}

impl ChunkRemover {
    pub fn new(
        session_id: impl Into<String>,
        meta: Arc<dyn MetaApi>,
        storage: Arc<StorageApiCache>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            meta,
            storage,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Best-effort removal: a failure on one key never stops the others, and
    /// "not found" anywhere counts as already removed.
    pub async fn remove_chunks(&self, keys: Vec<ChunkKey>) -> DeletionReport {
        let mut report = DeletionReport::default();
        if keys.is_empty() {
            return report;
        }

        let metas = match self
            .meta
            .get_chunk_metas(&keys, MetaFields::BANDS, ErrorMode::Ignore)
            .await
        {
            Ok(metas) => metas,
            Err(e) => {
                warn!(
                    "Failed to look up metadata of {} chunks in session {}: {}",
                    keys.len(),
                    self.session_id,
                    e
                );
                report.failed = keys.into_iter().map(|k| (k, e.to_string())).collect();
                return report;
            }
        };

        let mut by_address: BTreeMap<String, Vec<ChunkKey>> = BTreeMap::new();
        let mut present = Vec::new();
        for (key, meta) in keys.into_iter().zip(metas) {
            match meta {
                None => report.missing.push(key),
                Some(meta) => {
                    for band in meta.bands {
                        by_address.entry(band.address).or_default().push(key.clone());
                    }
                    present.push(key);
                }
            }
        }

        let deletions = by_address
            .into_iter()
            .map(|(address, keys)| self.delete_on(address, keys));
        let mut failed: BTreeMap<ChunkKey, String> = BTreeMap::new();
        for outcome in join_all(deletions).await {
            failed.extend(outcome);
        }

        // a key only counts as removed once its metadata is gone too
        let meta_error = match self.meta.del_chunk_metas(&present).await {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    "Failed to delete metadata of {} chunks in session {}: {}",
                    present.len(),
                    self.session_id,
                    e
                );
                Some(format!("metadata not deleted: {e}"))
            }
        };

        for key in present {
            match (failed.remove(&key), &meta_error) {
                (Some(reason), _) => report.failed.push((key, reason)),
                (None, Some(reason)) => report.failed.push((key, reason.clone())),
                (None, None) => report.removed.push(key),
            }
        }
        info!(
            "Session {} removed {} chunks ({} missing, {} failed)",
            self.session_id,
            report.removed.len(),
            report.missing.len(),
            report.failed.len()
        );
        report
    }

    async fn delete_on(&self, address: String, keys: Vec<ChunkKey>) -> Vec<(ChunkKey, String)> {
        let api = match self.storage.get(&self.session_id, &address).await {
            Ok(api) => api,
            Err(e) => {
                warn!(
                    "Cannot reach storage on {} to delete {} chunks: {}",
                    address,
                    keys.len(),
                    e
                );
                return keys.into_iter().map(|k| (k, e.to_string())).collect();
            }
        };
        let outcomes = api.delete_batch(&keys, ErrorMode::Ignore).await;
        keys.into_iter()
            .zip(outcomes)
            .filter_map(|(key, outcome)| match outcome {
                Ok(()) => None,
                Err(e) => {
                    warn!("Failed to delete {} on {}: {}", key, address, e);
                    Some((key, e.to_string()))
                }
            })
            .collect()
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use libstorage::{MetaApi, StorageApiCache};
use tokio::sync::RwLock;
use tracing::info;

use crate::actor::{LifecycleApi, spawn_tracker};
use crate::error::LifecycleError;
use crate::gc::{ChunkRemover, DeletionReport};

pub fn gen_uid(session_id: &str) -> String {
    format!("{session_id}_lifecycle_tracker")
}

/// Trackers of the sessions living in this process, addressed by uid.
#[derive(Default)]
pub struct LifecycleService {
    trackers: RwLock<HashMap<String, LifecycleApi>>,
}

impl LifecycleService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the tracker of `session_id`, or returns the running one.
    pub async fn create_tracker(
        &self,
        session_id: &str,
        meta: Arc<dyn MetaApi>,
        storage: Arc<StorageApiCache>,
    ) -> LifecycleApi {
        let uid = gen_uid(session_id);
        let mut trackers = self.trackers.write().await;
        if let Some(api) = trackers.get(&uid) {
            return api.clone();
        }
        let api = spawn_tracker(uid.clone(), ChunkRemover::new(session_id, meta, storage));
        trackers.insert(uid, api.clone());
        api
    }

    pub async fn get_tracker(&self, session_id: &str) -> Result<LifecycleApi, LifecycleError> {
        let uid = gen_uid(session_id);
        self.trackers
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or(LifecycleError::UnknownTracker(uid))
    }

    /// Tears the tracker down and forgets it.
    pub async fn destroy_tracker(
        &self,
        session_id: &str,
    ) -> Result<DeletionReport, LifecycleError> {
        let uid = gen_uid(session_id);
        let api = self
            .trackers
            .write()
            .await
            .remove(&uid)
            .ok_or_else(|| LifecycleError::UnknownTracker(uid.clone()))?;
        let report = api.teardown().await?;
        info!(
            "Destroyed tracker {}, removed {} chunks at teardown",
            uid,
            report.removed.len()
        );
        Ok(report)
    }
}

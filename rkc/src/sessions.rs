use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use liblifecycle::LifecycleService;
use libsession::{SessionApi, SessionError, SessionHandles};
use libstorage::{MetaService, NodeStorage, StorageApiCache};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::task::LocalTaskService;

/// Session service of an in-process cluster. Each session gets its own
/// meta store, lifecycle tracker and task service.
pub struct LocalSessionService {
    nodes: Vec<Arc<NodeStorage>>,
    meta: Arc<MetaService>,
    storage: Arc<StorageApiCache>,
    lifecycle: LifecycleService,
    sessions: RwLock<HashMap<String, SessionHandles>>,
    tasks: RwLock<HashMap<String, Arc<LocalTaskService>>>,
}

impl LocalSessionService {
    pub fn new(
        nodes: Vec<Arc<NodeStorage>>,
        meta: Arc<MetaService>,
        storage: Arc<StorageApiCache>,
    ) -> Self {
        Self {
            nodes,
            meta,
            storage,
            lifecycle: LifecycleService::new(),
            sessions: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn meta(&self) -> &Arc<MetaService> {
        &self.meta
    }

    /// Deletes every live session.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.delete_session(&id).await {
                warn!("Failed to delete session {} on shutdown: {}", id, e);
            }
        }
    }
}

#[async_trait]
impl SessionApi for LocalSessionService {
    async fn create_session(&self, session_id: &str) -> Result<SessionHandles, SessionError> {
        let mut sessions = self.sessions.write().await;
        if let Some(handles) = sessions.get(session_id) {
            return Ok(handles.clone());
        }

        let meta = self.meta.create_session(session_id).await;
        let lifecycle = self
            .lifecycle
            .create_tracker(session_id, meta.clone(), self.storage.clone())
            .await;
        let task = Arc::new(LocalTaskService::new(
            session_id,
            self.nodes.iter().map(|n| n.address().to_string()).collect(),
            meta.clone(),
            self.storage.clone(),
            lifecycle.clone(),
        ));
        let handles = SessionHandles {
            task: task.clone(),
            lifecycle,
            meta,
        };
        self.tasks.write().await.insert(session_id.to_string(), task);
        sessions.insert(session_id.to_string(), handles.clone());
        info!("Created session {}", session_id);
        Ok(handles)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        if self.sessions.write().await.remove(session_id).is_none() {
            return Err(SessionError::UnknownSession(session_id.to_string()));
        }
        if let Some(task) = self.tasks.write().await.remove(session_id) {
            task.shutdown().await;
        }
        let report = self.lifecycle.destroy_tracker(session_id).await?;
        if !report.failed.is_empty() {
            warn!(
                "Session {} left {} chunks behind: {:?}",
                session_id,
                report.failed.len(),
                report.failed
            );
        }
        // objects of tasks aborted before `track` are unknown to the tracker
        for node in &self.nodes {
            match node.clear_session(session_id).await {
                Ok(0) => {}
                Ok(n) => warn!(
                    "Purged {} untracked objects of session {} on {}",
                    n,
                    session_id,
                    node.address()
                ),
                Err(e) => warn!(
                    "Failed to purge session {} on {}: {}",
                    session_id,
                    node.address(),
                    e
                ),
            }
        }
        self.meta.remove_session(session_id).await;
        self.storage.invalidate_session(session_id).await;
        info!("Deleted session {}", session_id);
        Ok(())
    }

    async fn get_sessions(&self) -> Result<Vec<String>, SessionError> {
        let mut ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

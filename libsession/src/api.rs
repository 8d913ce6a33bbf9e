//! Services a session consumes from the cluster.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{FetchTileable, TaskResult, TileableGraph};
use liblifecycle::LifecycleApi;
use libstorage::MetaApi;

use crate::error::SessionError;

/// Session-scoped services handed out when a session is created.
#[derive(Clone)]
pub struct SessionHandles {
    pub task: Arc<dyn TaskApi>,
    pub lifecycle: LifecycleApi,
    pub meta: Arc<dyn MetaApi>,
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn create_session(&self, session_id: &str) -> Result<SessionHandles, SessionError>;

    /// Fails with [`SessionError::UnknownSession`] for ids the cluster does not know.
    async fn delete_session(&self, session_id: &str) -> Result<(), SessionError>;

    async fn get_sessions(&self) -> Result<Vec<String>, SessionError>;
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn submit_tileable_graph(
        &self,
        graph: TileableGraph,
        task_name: Option<String>,
        fuse_enabled: bool,
        extra_config: HashMap<String, String>,
    ) -> Result<String, SessionError>;

    /// Waits at most `timeout`; `None` means the task is still running.
    async fn wait_task(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, SessionError>;

    async fn get_task_progress(&self, task_id: &str) -> Result<f64, SessionError>;

    /// One entry per result tileable of the submitted graph, in the same order.
    async fn get_fetch_tileables(&self, task_id: &str) -> Result<Vec<FetchTileable>, SessionError>;
}

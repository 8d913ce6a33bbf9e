use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use common::{
    ChunkData, ChunkKey, FetchTileable, Tileable, TileableGraph, TileableKey, new_session_id,
};
use tracing::{debug, info, warn};

use crate::api::{SessionApi, SessionHandles};
use crate::error::SessionError;
use crate::execution::{ExecuteOptions, ExecutedTable, ExecutionInfo, WatchJob};
use crate::fetch::{StorageRoute, fetch_chunks, resolve};
use crate::handle::{HandleRegistry, TileableHandle};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Minimum spacing between two status polls of a task.
    pub poll_interval: Duration,
    /// Bound of each `wait_task` call.
    pub wait_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            wait_timeout: Duration::from_millis(500),
        }
    }
}

pub(crate) struct SessionInner {
    session_id: String,
    config: SessionConfig,
    session_api: Arc<dyn SessionApi>,
    services: SessionHandles,
    storage: StorageRoute,
    executed: Arc<ExecutedTable>,
    watchers: Mutex<Vec<ExecutionInfo>>,
    pub(crate) handles: HandleRegistry,
    closed: AtomicBool,
}

impl SessionInner {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SessionError::Closed(self.session_id.clone()))
        } else {
            Ok(())
        }
    }

    /// Decrefs `keys` and forgets the results whose count dropped to zero.
    async fn decref(&self, keys: Vec<TileableKey>) -> Result<(), SessionError> {
        if keys.is_empty() {
            return Ok(());
        }
        let lifecycle = &self.services.lifecycle;
        lifecycle.decref_tileables(keys.clone()).await?;
        let counts = lifecycle.get_tileable_ref_counts(keys.clone()).await?;
        let mut executed = self.executed.write().await;
        for (key, count) in keys.iter().zip(counts) {
            if count == 0 {
                executed.remove(key);
            }
        }
        Ok(())
    }

    /// Decrefs only the keys this session has results for.
    async fn decref_executed(&self, keys: Vec<TileableKey>) -> Result<(), SessionError> {
        let keys: Vec<TileableKey> = {
            let executed = self.executed.read().await;
            keys.into_iter()
                .filter(|key| executed.contains_key(key))
                .collect()
        };
        self.decref(keys).await
    }

    pub(crate) async fn release_owned(&self, key: &TileableKey) -> Result<(), SessionError> {
        if self.handles.drop_one(key) {
            debug!("Last handle of {} released in session {}", key, self.session_id);
            self.decref_executed(vec![key.clone()]).await?;
        }
        Ok(())
    }

    async fn flush_released(&self) -> Result<(), SessionError> {
        let pending = self.handles.take_pending();
        if !pending.is_empty() {
            debug!("Flushing {} dropped handles of session {}", pending.len(), self.session_id);
            self.decref_executed(pending).await?;
        }
        Ok(())
    }
}

/// One conversation with the cluster. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Creates `session_id` (a fresh uuid when `None`) on the cluster.
    pub async fn init(
        session_api: Arc<dyn SessionApi>,
        storage: StorageRoute,
        config: SessionConfig,
        session_id: Option<String>,
    ) -> Result<Self, SessionError> {
        let session_id = session_id.unwrap_or_else(new_session_id);
        let services = session_api.create_session(&session_id).await?;
        info!("Session {} created", session_id);
        Ok(Self {
            inner: Arc::new(SessionInner {
                session_id,
                config,
                session_api,
                services,
                storage,
                executed: Arc::new(ExecutedTable::default()),
                watchers: Mutex::new(Vec::new()),
                handles: HandleRegistry::default(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Submits the graph behind `tileables` and returns without waiting.
    ///
    /// Tileables this session already holds results for are not submitted
    /// again; if none is left the returned info is already succeeded.
    pub async fn execute(
        &self,
        tileables: &[Tileable],
        options: ExecuteOptions,
    ) -> Result<ExecutionInfo, SessionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.flush_released().await?;

        let (pending, done_by) = {
            let executed = inner.executed.read().await;
            let mut seen = HashSet::new();
            let mut pending = Vec::new();
            let mut done_by = None;
            for tileable in tileables {
                if let Some(found) = executed.get(tileable.key()) {
                    done_by.get_or_insert_with(|| found.task_id.clone());
                } else if seen.insert(tileable.key().clone()) {
                    pending.push(tileable.clone());
                }
            }
            (pending, done_by)
        };
        if pending.is_empty() {
            debug!("Nothing to submit in session {}", inner.session_id);
            return Ok(ExecutionInfo::finished(done_by.unwrap_or_default()));
        }

        let graph = TileableGraph::build(&pending);
        let task_id = inner
            .services
            .task
            .submit_tileable_graph(
                graph,
                options.task_name.clone(),
                options.fuse_enabled,
                options.extra_config.clone(),
            )
            .await?;
        info!(
            "Session {} submitted task {} for {} tileables",
            inner.session_id,
            task_id,
            pending.len()
        );

        let job = WatchJob {
            task: inner.services.task.clone(),
            lifecycle: inner.services.lifecycle.clone(),
            task_id,
            tileables: pending,
            executed: inner.executed.clone(),
            poll_interval: inner.config.poll_interval,
            wait_timeout: inner.config.wait_timeout,
        };
        let info = ExecutionInfo::spawn(job, options.timeout);
        let mut watchers = inner.watchers.lock().unwrap_or_else(PoisonError::into_inner);
        watchers.retain(|w| !w.is_done());
        watchers.push(info.clone());
        Ok(info)
    }

    /// Reads the results of executed tileables, or of plain slices of them.
    pub async fn fetch(&self, tileables: &[Tileable]) -> Result<Vec<ChunkData>, SessionError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        inner.flush_released().await?;

        let resolved = {
            let executed = inner.executed.read().await;
            tileables
                .iter()
                .map(|t| resolve(t, &executed))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut values = Vec::with_capacity(resolved.len());
        for (fetch, levels) in resolved {
            let mut value = fetch_chunks(
                &inner.session_id,
                inner.services.meta.as_ref(),
                &inner.storage,
                &fetch,
            )
            .await?;
            for items in &levels {
                value = value.select(items)?;
            }
            values.push(value);
        }
        Ok(values)
    }

    /// Physical plan recorded for `tileable`, if it was executed here.
    pub async fn fetch_tileable(&self, tileable: &Tileable) -> Option<FetchTileable> {
        self.inner
            .executed
            .read()
            .await
            .get(tileable.key())
            .map(|e| e.fetch.clone())
    }

    /// Takes a handle on `tileable`; its results live until every handle is released.
    pub fn own(&self, tileable: &Tileable) -> TileableHandle {
        self.inner.handles.acquire(tileable.key());
        TileableHandle::new(tileable.clone(), Arc::downgrade(&self.inner))
    }

    pub async fn decref(&self, keys: &[TileableKey]) -> Result<(), SessionError> {
        self.inner.ensure_open()?;
        self.inner.decref(keys.to_vec()).await
    }

    /// Positive chunk reference counts of this session.
    pub async fn get_ref_counts(&self) -> Result<HashMap<ChunkKey, u64>, SessionError> {
        Ok(self
            .inner
            .services
            .lifecycle
            .get_all_chunk_ref_counts()
            .await?)
    }

    /// Stops all watchers and deletes the session on the cluster, which
    /// frees every chunk it still holds. Calling it again is a no-op.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let watchers = std::mem::take(
            &mut *inner.watchers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for watcher in &watchers {
            watcher.cancel();
        }
        if let Err(e) = inner.flush_released().await {
            warn!("Failed to release handles of session {}: {}", inner.session_id, e);
        }
        inner.session_api.delete_session(&inner.session_id).await?;
        inner.storage.invalidate_session(&inner.session_id).await;
        inner.executed.write().await.clear();
        info!("Session {} destroyed", inner.session_id);
        Ok(())
    }
}

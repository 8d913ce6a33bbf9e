//! Submitted tasks and the watcher that drives each one to a terminal state.
//!
//! ```text
//! Submitted -> Polling -> Succeeded
//!                      -> Failed
//!                      -> Cancelled | TimedOut | Errored   (local outcomes)
//! ```
//!
//! The watcher is the only writer of a task's status; any number of
//! [`ExecutionInfo`] clones read it.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{FetchTileable, RemoteError, TaskResult, Tileable, TileableKey};
use liblifecycle::LifecycleApi;
use tokio::sync::{RwLock, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::TaskApi;
use crate::error::SessionError;

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub fuse_enabled: bool,
    pub task_name: Option<String>,
    pub extra_config: HashMap<String, String>,
    /// Overall limit on how long the watcher waits for the task.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionState {
    Submitted,
    Polling,
    Succeeded,
    Failed(RemoteError),
    Cancelled,
    TimedOut,
    /// The task service itself failed while being polled.
    Errored(String),
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Submitted | ExecutionState::Polling)
    }
}

#[derive(Debug, Clone)]
struct WatchStatus {
    state: ExecutionState,
    progress: f64,
}

/// Materialized tileable and the task that produced it.
#[derive(Debug, Clone)]
pub(crate) struct Executed {
    pub task_id: String,
    pub fetch: FetchTileable,
}

pub(crate) type ExecutedTable = RwLock<HashMap<TileableKey, Executed>>;

struct WatchControl {
    status: watch::Sender<WatchStatus>,
    abort: OnceLock<AbortHandle>,
    timeout: Option<Duration>,
}

impl WatchControl {
    fn new(state: ExecutionState, progress: f64, timeout: Option<Duration>) -> Self {
        let (status, _) = watch::channel(WatchStatus { state, progress });
        Self {
            status,
            abort: OnceLock::new(),
            timeout,
        }
    }

    /// Moves to `state` unless a terminal state was already published.
    fn finish(&self, state: ExecutionState) -> bool {
        self.status.send_if_modified(|s| {
            if s.state.is_terminal() {
                return false;
            }
            if matches!(state, ExecutionState::Succeeded | ExecutionState::Failed(_)) {
                s.progress = 1.0;
            }
            s.state = state;
            true
        })
    }
}

/// Handle on one submitted task. Clones observe the same task.
#[derive(Clone)]
pub struct ExecutionInfo {
    task_id: String,
    control: Arc<WatchControl>,
}

impl ExecutionInfo {
    pub(crate) fn spawn(job: WatchJob, timeout: Option<Duration>) -> Self {
        let control = Arc::new(WatchControl::new(ExecutionState::Submitted, 0.0, timeout));
        let task_id = job.task_id.clone();
        let handle = tokio::spawn(watch_task(job, control.clone()));
        let _ = control.abort.set(handle.abort_handle());
        Self { task_id, control }
    }

    /// Already finished; used when nothing needed to be submitted.
    pub(crate) fn finished(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            control: Arc::new(WatchControl::new(ExecutionState::Succeeded, 1.0, None)),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn progress(&self) -> f64 {
        self.control.status.borrow().progress
    }

    pub fn state(&self) -> ExecutionState {
        self.control.status.borrow().state.clone()
    }

    pub fn is_done(&self) -> bool {
        self.control.status.borrow().state.is_terminal()
    }

    /// Waits for the terminal state and turns failures into errors.
    pub async fn wait(&self) -> Result<(), SessionError> {
        let mut rx = self.control.status.subscribe();
        let state = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map(|s| s.state.clone())
            .map_err(|_| SessionError::Cancelled(self.task_id.clone()))?;
        match state {
            ExecutionState::Succeeded => Ok(()),
            ExecutionState::Failed(source) => Err(SessionError::ExecutionFailed {
                task_id: self.task_id.clone(),
                source,
            }),
            ExecutionState::TimedOut => Err(SessionError::Timeout {
                task_id: self.task_id.clone(),
                timeout: self.control.timeout.unwrap_or_default(),
            }),
            ExecutionState::Errored(message) => Err(SessionError::Service(message)),
            _ => Err(SessionError::Cancelled(self.task_id.clone())),
        }
    }

    /// Stops watching. The remote task is left to the task service.
    pub fn cancel(&self) {
        if let Some(abort) = self.control.abort.get() {
            abort.abort();
        }
        if self.control.finish(ExecutionState::Cancelled) {
            info!("Stopped watching task {}", self.task_id);
        }
    }
}

pub(crate) struct WatchJob {
    pub task: Arc<dyn TaskApi>,
    pub lifecycle: LifecycleApi,
    pub task_id: String,
    pub tileables: Vec<Tileable>,
    pub executed: Arc<ExecutedTable>,
    pub poll_interval: Duration,
    pub wait_timeout: Duration,
}

impl WatchJob {
    async fn poll(&self, control: &WatchControl) -> Result<TaskResult, SessionError> {
        loop {
            let started = Instant::now();
            if let Some(result) = self
                .task
                .wait_task(&self.task_id, self.wait_timeout)
                .await?
            {
                return Ok(result);
            }
            let progress = self.task.get_task_progress(&self.task_id).await?;
            control.status.send_modify(|s| s.progress = progress);
            let spent = started.elapsed();
            if spent < self.poll_interval {
                tokio::time::sleep(self.poll_interval - spent).await;
            }
        }
    }

    async fn publish(&self) -> Result<(), SessionError> {
        let fetches = self.task.get_fetch_tileables(&self.task_id).await?;
        if fetches.len() != self.tileables.len() {
            return Err(SessionError::Service(format!(
                "task {} returned {} fetch tileables for {} results",
                self.task_id,
                fetches.len(),
                self.tileables.len()
            )));
        }
        let mut duplicates = Vec::new();
        {
            let mut executed = self.executed.write().await;
            for (tileable, fetch) in self.tileables.iter().zip(fetches) {
                tileable.set_params(fetch.params.clone());
                if executed.contains_key(tileable.key()) {
                    duplicates.push(tileable.key().clone());
                    continue;
                }
                executed.insert(
                    tileable.key().clone(),
                    Executed {
                        task_id: self.task_id.clone(),
                        fetch,
                    },
                );
            }
        }
        // another task published these first; keep one reference per result
        if !duplicates.is_empty() {
            debug!(
                "Task {} repeated {} published results, dropping its references",
                self.task_id,
                duplicates.len()
            );
            self.lifecycle.decref_tileables(duplicates).await?;
        }
        Ok(())
    }
}

async fn watch_task(job: WatchJob, control: Arc<WatchControl>) {
    control.status.send_if_modified(|s| {
        if s.state != ExecutionState::Submitted {
            return false;
        }
        s.state = ExecutionState::Polling;
        true
    });
    debug!("Watching task {}", job.task_id);

    let polled = match control.timeout {
        Some(limit) => match tokio::time::timeout(limit, job.poll(&control)).await {
            Ok(polled) => polled,
            Err(_) => {
                warn!("Task {} did not finish within {:?}", job.task_id, limit);
                control.finish(ExecutionState::TimedOut);
                return;
            }
        },
        None => job.poll(&control).await,
    };

    let state = match polled {
        Err(e) => {
            warn!("Lost track of task {}: {}", job.task_id, e);
            ExecutionState::Errored(e.to_string())
        }
        Ok(TaskResult {
            error: Some(remote),
            ..
        }) => {
            warn!(
                "Task {} failed remotely\n{}",
                job.task_id,
                remote.formatted_traceback()
            );
            ExecutionState::Failed(remote)
        }
        Ok(_) => match job.publish().await {
            Ok(()) => {
                info!("Task {} succeeded", job.task_id);
                ExecutionState::Succeeded
            }
            Err(e) => ExecutionState::Errored(e.to_string()),
        },
    };
    control.finish(state);
}

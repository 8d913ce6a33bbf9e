use std::collections::HashMap;

use common::{ChunkKey, TileableKey};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::LifecycleError;
use crate::gc::{ChunkRemover, DeletionReport};
use crate::state::TrackerState;

type Reply<T> = oneshot::Sender<Result<T, LifecycleError>>;

/// Every request a tracker understands.
enum TrackerRequest {
    Track {
        tileable_key: TileableKey,
        chunk_keys: Vec<ChunkKey>,
        reply: oneshot::Sender<()>,
    },
    IncrefChunks {
        chunk_keys: Vec<ChunkKey>,
        reply: oneshot::Sender<()>,
    },
    DecrefChunks {
        chunk_keys: Vec<ChunkKey>,
        reply: Reply<DeletionHandle>,
    },
    IncrefTileables {
        tileable_keys: Vec<TileableKey>,
        reply: Reply<()>,
    },
    DecrefTileables {
        tileable_keys: Vec<TileableKey>,
        reply: Reply<DeletionHandle>,
    },
    GetChunkRefCounts {
        chunk_keys: Vec<ChunkKey>,
        reply: oneshot::Sender<Vec<u64>>,
    },
    GetTileableRefCounts {
        tileable_keys: Vec<TileableKey>,
        reply: oneshot::Sender<Vec<u64>>,
    },
    GetAllChunkRefCounts {
        reply: oneshot::Sender<HashMap<ChunkKey, u64>>,
    },
    Teardown {
        reply: oneshot::Sender<DeletionReport>,
    },
}

/// Completion of a deletion batch scheduled by a decref.
pub struct DeletionHandle {
    uid: String,
    rx: Option<oneshot::Receiver<DeletionReport>>,
}

impl DeletionHandle {
    fn ready(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            rx: None,
        }
    }

    /// True when the decref released nothing.
    pub fn is_noop(&self) -> bool {
        self.rx.is_none()
    }

    pub async fn wait(self) -> Result<DeletionReport, LifecycleError> {
        match self.rx {
            None => Ok(DeletionReport::default()),
            Some(rx) => rx.await.map_err(|_| LifecycleError::Closed(self.uid)),
        }
    }
}

struct Tracker {
    uid: String,
    state: TrackerState,
    remover: ChunkRemover,
    deletions: JoinSet<()>,
}

impl Tracker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TrackerRequest>) {
        info!("Lifecycle tracker {} started", self.uid);
        loop {
            tokio::select! {
                Some(request) = rx.recv() => self.dispatch(request).await,
                Some(joined) = self.deletions.join_next(), if !self.deletions.is_empty() => {
                    if let Err(e) = joined {
                        error!("Deletion task of {} failed: {}", self.uid, e);
                    }
                }
                else => break,
            }
        }
        while self.deletions.join_next().await.is_some() {}
        info!("Lifecycle tracker {} stopped", self.uid);
    }

    async fn dispatch(&mut self, request: TrackerRequest) {
        match request {
            TrackerRequest::Track {
                tileable_key,
                chunk_keys,
                reply,
            } => {
                self.state.track(tileable_key, chunk_keys);
                let _ = reply.send(());
            }
            TrackerRequest::IncrefChunks { chunk_keys, reply } => {
                self.state.incref_chunks(&chunk_keys);
                let _ = reply.send(());
            }
            TrackerRequest::DecrefChunks { chunk_keys, reply } => {
                let result = self
                    .state
                    .decref_chunks(&chunk_keys)
                    .map(|released| self.schedule_removal(released));
                let _ = reply.send(result);
            }
            TrackerRequest::IncrefTileables {
                tileable_keys,
                reply,
            } => {
                let _ = reply.send(self.state.incref_tileables(&tileable_keys));
            }
            TrackerRequest::DecrefTileables {
                tileable_keys,
                reply,
            } => {
                let result = self
                    .state
                    .decref_tileables(&tileable_keys)
                    .map(|released| self.schedule_removal(released));
                let _ = reply.send(result);
            }
            TrackerRequest::GetChunkRefCounts { chunk_keys, reply } => {
                let _ = reply.send(self.state.get_chunk_ref_counts(&chunk_keys));
            }
            TrackerRequest::GetTileableRefCounts {
                tileable_keys,
                reply,
            } => {
                let _ = reply.send(self.state.get_tileable_ref_counts(&tileable_keys));
            }
            TrackerRequest::GetAllChunkRefCounts { reply } => {
                let _ = reply.send(self.state.get_all_chunk_ref_counts());
            }
            TrackerRequest::Teardown { reply } => {
                let report = self.teardown().await;
                let _ = reply.send(report);
            }
        }
    }

    fn schedule_removal(&mut self, released: Vec<ChunkKey>) -> DeletionHandle {
        if released.is_empty() {
            return DeletionHandle::ready(&self.uid);
        }
        debug!("Tracker {} scheduling removal of {} chunks", self.uid, released.len());
        let (tx, rx) = oneshot::channel();
        let remover = self.remover.clone();
        self.deletions.spawn(async move {
            let report = remover.remove_chunks(released).await;
            let _ = tx.send(report);
        });
        DeletionHandle {
            uid: self.uid.clone(),
            rx: Some(rx),
        }
    }

    async fn teardown(&mut self) -> DeletionReport {
        while let Some(joined) = self.deletions.join_next().await {
            if let Err(e) = joined {
                error!("Deletion task of {} failed: {}", self.uid, e);
            }
        }
        let live = self.state.drain_live_chunks();
        info!("Tracker {} tearing down, removing {} live chunks", self.uid, live.len());
        self.remover.remove_chunks(live).await
    }
}

/// Handle to a running tracker. Clones share the same tracker.
#[derive(Clone)]
pub struct LifecycleApi {
    uid: String,
    tx: mpsc::UnboundedSender<TrackerRequest>,
}

/// Starts the tracker task of a session; it stops once every handle is dropped.
pub fn spawn_tracker(uid: impl Into<String>, remover: ChunkRemover) -> LifecycleApi {
    let uid = uid.into();
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = Tracker {
        uid: uid.clone(),
        state: TrackerState::new(),
        remover,
        deletions: JoinSet::new(),
    };
    tokio::spawn(tracker.run(rx));
    LifecycleApi { uid, tx }
}

impl LifecycleApi {
    pub fn uid(&self) -> &str {
        &self.uid
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> TrackerRequest,
    ) -> Result<T, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| LifecycleError::Closed(self.uid.clone()))?;
        rx.await.map_err(|_| LifecycleError::Closed(self.uid.clone()))
    }

    pub async fn track(
        &self,
        tileable_key: TileableKey,
        chunk_keys: Vec<ChunkKey>,
    ) -> Result<(), LifecycleError> {
        self.request(|reply| TrackerRequest::Track {
            tileable_key,
            chunk_keys,
            reply,
        })
        .await
    }

    pub async fn incref_chunks(&self, chunk_keys: Vec<ChunkKey>) -> Result<(), LifecycleError> {
        self.request(|reply| TrackerRequest::IncrefChunks { chunk_keys, reply })
            .await
    }

    /// Decrements and waits until every chunk that reached zero is removed.
    pub async fn decref_chunks(
        &self,
        chunk_keys: Vec<ChunkKey>,
    ) -> Result<DeletionReport, LifecycleError> {
        self.decref_chunks_nowait(chunk_keys).await?.wait().await
    }

    pub async fn decref_chunks_nowait(
        &self,
        chunk_keys: Vec<ChunkKey>,
    ) -> Result<DeletionHandle, LifecycleError> {
        self.request(|reply| TrackerRequest::DecrefChunks { chunk_keys, reply })
            .await?
    }

    pub async fn incref_tileables(
        &self,
        tileable_keys: Vec<TileableKey>,
    ) -> Result<(), LifecycleError> {
        self.request(|reply| TrackerRequest::IncrefTileables {
            tileable_keys,
            reply,
        })
        .await?
    }

    pub async fn decref_tileables(
        &self,
        tileable_keys: Vec<TileableKey>,
    ) -> Result<DeletionReport, LifecycleError> {
        self.decref_tileables_nowait(tileable_keys)
            .await?
            .wait()
            .await
    }

    /// Returns once the deletion is scheduled; await the handle to observe it.
    pub async fn decref_tileables_nowait(
        &self,
        tileable_keys: Vec<TileableKey>,
    ) -> Result<DeletionHandle, LifecycleError> {
        self.request(|reply| TrackerRequest::DecrefTileables {
            tileable_keys,
            reply,
        })
        .await?
    }

    pub async fn get_chunk_ref_counts(
        &self,
        chunk_keys: Vec<ChunkKey>,
    ) -> Result<Vec<u64>, LifecycleError> {
        self.request(|reply| TrackerRequest::GetChunkRefCounts { chunk_keys, reply })
            .await
    }

    pub async fn get_tileable_ref_counts(
        &self,
        tileable_keys: Vec<TileableKey>,
    ) -> Result<Vec<u64>, LifecycleError> {
        self.request(|reply| TrackerRequest::GetTileableRefCounts {
            tileable_keys,
            reply,
        })
        .await
    }

    pub async fn get_all_chunk_ref_counts(
        &self,
    ) -> Result<HashMap<ChunkKey, u64>, LifecycleError> {
        self.request(|reply| TrackerRequest::GetAllChunkRefCounts { reply })
            .await
    }

    /// Waits for pending deletions, then removes every chunk still referenced
    /// and clears all counts.
    pub async fn teardown(&self) -> Result<DeletionReport, LifecycleError> {
        self.request(|reply| TrackerRequest::Teardown { reply })
            .await
    }
}

//! In-process task service: runs a submitted tileable graph on the local
//! nodes and stores its result chunks.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    Chunk, ChunkData, ChunkIndex, ChunkKey, ChunkMeta, ErrorMode, FetchTileable, GraphNode,
    MetaFields, Operand, RemoteError, StorageLevel, TaskResult, Tensor, TileableGraph,
    TileableKey, TileableParams, merge_chunks,
};
use futures::FutureExt;
use liblifecycle::LifecycleApi;
use libsession::{SessionError, TaskApi};
use libstorage::{MetaApi, StorageApiCache};
use tokio::sync::{RwLock, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Chunks of one computed tileable, before they are stored.
struct Materialized {
    shape: Vec<usize>,
    chunks: Vec<(ChunkIndex, Tensor)>,
}

struct TaskRecord {
    progress: watch::Sender<f64>,
    result: watch::Sender<Option<TaskResult>>,
    fetches: RwLock<Vec<FetchTileable>>,
    abort: std::sync::OnceLock<AbortHandle>,
}

impl TaskRecord {
    fn new() -> Self {
        Self {
            progress: watch::channel(0.0).0,
            result: watch::channel(None).0,
            fetches: RwLock::new(Vec::new()),
            abort: std::sync::OnceLock::new(),
        }
    }
}

#[derive(Clone)]
struct Executor {
    session_id: String,
    nodes: Arc<Vec<String>>,
    next_node: Arc<AtomicUsize>,
    meta: Arc<dyn MetaApi>,
    storage: Arc<StorageApiCache>,
    lifecycle: LifecycleApi,
}

pub struct LocalTaskService {
    executor: Executor,
    tasks: RwLock<HashMap<String, Arc<TaskRecord>>>,
}

impl LocalTaskService {
    pub fn new(
        session_id: impl Into<String>,
        nodes: Vec<String>,
        meta: Arc<dyn MetaApi>,
        storage: Arc<StorageApiCache>,
        lifecycle: LifecycleApi,
    ) -> Self {
        Self {
            executor: Executor {
                session_id: session_id.into(),
                nodes: Arc::new(nodes),
                next_node: Arc::new(AtomicUsize::new(0)),
                meta,
                storage,
                lifecycle,
            },
            tasks: RwLock::new(HashMap::new()),
        }
    }

    async fn record(&self, task_id: &str) -> Result<Arc<TaskRecord>, SessionError> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| SessionError::Service(format!("unknown task {task_id}")))
    }

    /// Aborts every task still running; waiters see them as failed.
    pub async fn shutdown(&self) {
        for (task_id, record) in self.tasks.read().await.iter() {
            if record.result.borrow().is_some() {
                continue;
            }
            if let Some(abort) = record.abort.get() {
                debug!("Aborting task {}", task_id);
                abort.abort();
            }
            let cancelled = RemoteError::new("CancelledError", "session is shutting down");
            record
                .result
                .send_replace(Some(TaskResult::failed(task_id, cancelled)));
        }
    }
}

#[async_trait]
impl TaskApi for LocalTaskService {
    async fn submit_tileable_graph(
        &self,
        graph: TileableGraph,
        task_name: Option<String>,
        fuse_enabled: bool,
        _extra_config: HashMap<String, String>,
    ) -> Result<String, SessionError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Session {} accepted task {} ({}) with {} tileables, fuse {}",
            self.executor.session_id,
            task_id,
            task_name.as_deref().unwrap_or("unnamed"),
            graph.len(),
            fuse_enabled
        );
        let record = Arc::new(TaskRecord::new());
        self.tasks
            .write()
            .await
            .insert(task_id.clone(), record.clone());

        let executor = self.executor.clone();
        let run_id = task_id.clone();
        let running = record.clone();
        let handle = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(executor.run(&graph, &running))
                .catch_unwind()
                .await;
            let result = match outcome {
                Ok(Ok(fetches)) => {
                    *running.fetches.write().await = fetches;
                    TaskResult::succeeded(&run_id)
                }
                Ok(Err(error)) => TaskResult::failed(&run_id, error),
                Err(_) => {
                    warn!("Task {} panicked", run_id);
                    let panicked = RemoteError::new("SystemError", "task execution panicked")
                        .with_frame(format!("task {run_id}"));
                    TaskResult::failed(&run_id, panicked)
                }
            };
            running.progress.send_replace(1.0);
            running.result.send_replace(Some(result));
        });
        let _ = record.abort.set(handle.abort_handle());
        Ok(task_id)
    }

    async fn wait_task(
        &self,
        task_id: &str,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, SessionError> {
        let record = self.record(task_id).await?;
        let mut rx = record.result.subscribe();
        match tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await {
            Ok(Ok(result)) => Ok(result.clone()),
            Ok(Err(_)) => Err(SessionError::Service(format!("task {task_id} vanished"))),
            Err(_) => Ok(None),
        }
    }

    async fn get_task_progress(&self, task_id: &str) -> Result<f64, SessionError> {
        Ok(*self.record(task_id).await?.progress.borrow())
    }

    async fn get_fetch_tileables(&self, task_id: &str) -> Result<Vec<FetchTileable>, SessionError> {
        Ok(self.record(task_id).await?.fetches.read().await.clone())
    }
}

impl Executor {
    async fn run(
        &self,
        graph: &TileableGraph,
        record: &TaskRecord,
    ) -> Result<Vec<FetchTileable>, RemoteError> {
        let mut computed: HashMap<TileableKey, Materialized> = HashMap::new();
        let steps = graph.len() + graph.results.len();
        for (done, node) in graph.nodes.iter().enumerate() {
            let value = compute(node, &computed)?;
            computed.insert(node.key.clone(), value);
            record.progress.send_replace((done + 1) as f64 / steps as f64);
        }

        let mut fetches = Vec::with_capacity(graph.results.len());
        for (stored, key) in graph.results.iter().enumerate() {
            let value = computed.get(key).ok_or_else(|| {
                RemoteError::new("KeyError", format!("result {key} was not computed"))
            })?;
            fetches.push(self.store(key, value).await?);
            record
                .progress
                .send_replace((graph.len() + stored + 1) as f64 / steps as f64);
        }
        Ok(fetches)
    }

    fn next_address(&self) -> Option<&str> {
        if self.nodes.is_empty() {
            return None;
        }
        let i = self.next_node.fetch_add(1, Ordering::Relaxed);
        Some(&self.nodes[i % self.nodes.len()])
    }

    /// Node already holding `chunk_key`, else the next one round-robin.
    async fn place(
        &self,
        chunk_key: &ChunkKey,
        key: &TileableKey,
    ) -> Result<String, RemoteError> {
        let known = self
            .meta
            .get_chunk_meta(chunk_key, MetaFields::BANDS, ErrorMode::Ignore)
            .await
            .map_err(|e| failure("StorageError", key, e))?
            .and_then(|meta| meta.bands.into_iter().next());
        if let Some(band) = known {
            return Ok(band.address);
        }
        self.next_address()
            .map(str::to_string)
            .ok_or_else(|| failure("StorageError", key, "no worker nodes to place chunks on"))
    }

    /// Places chunks, records their meta, then tracks and increfs the
    /// tileable so it lives until the client releases it.
    async fn store(
        &self,
        key: &TileableKey,
        value: &Materialized,
    ) -> Result<FetchTileable, RemoteError> {
        let mut chunks = Vec::with_capacity(value.chunks.len());
        for (index, tensor) in &value.chunks {
            let chunk_key = Chunk::key_for(key, index);
            let address = self.place(&chunk_key, key).await?;
            let api = self
                .storage
                .get(&self.session_id, &address)
                .await
                .map_err(|e| failure("StorageError", key, e))?;
            let info = api
                .put(&chunk_key, ChunkData::Tensor(tensor.clone()), StorageLevel::Memory)
                .await
                .map_err(|e| failure("StorageError", key, e))?;
            self.meta
                .set_chunk_meta(ChunkMeta {
                    chunk_key: chunk_key.clone(),
                    bands: vec![info.band],
                    memory_size: info.memory_size,
                    store_size: info.store_size,
                    shape: tensor.shape().to_vec(),
                    index: index.clone(),
                })
                .await
                .map_err(|e| failure("StorageError", key, e))?;
            chunks.push(Chunk {
                key: chunk_key,
                index: index.clone(),
                shape: tensor.shape().to_vec(),
            });
        }

        self.lifecycle
            .track(key.clone(), chunks.iter().map(|c| c.key.clone()).collect())
            .await
            .map_err(|e| failure("LifecycleError", key, e))?;
        self.lifecycle
            .incref_tileables(vec![key.clone()])
            .await
            .map_err(|e| failure("LifecycleError", key, e))?;
        debug!("Stored {} chunks of {}", chunks.len(), key);

        Ok(FetchTileable {
            tileable_key: key.clone(),
            params: TileableParams::known(&value.shape),
            chunks,
        })
    }
}

fn failure(kind: &str, key: &TileableKey, error: impl std::fmt::Display) -> RemoteError {
    RemoteError::new(kind, error.to_string()).with_frame(format!("storing result {key}"))
}

fn compute(
    node: &GraphNode,
    computed: &HashMap<TileableKey, Materialized>,
) -> Result<Materialized, RemoteError> {
    let input = |i: usize| {
        node.inputs
            .get(i)
            .and_then(|key| computed.get(key))
            .ok_or_else(|| {
                RemoteError::new("KeyError", format!("input {i} of {} is missing", node.key))
                    .with_frame(format!("operand {} of tileable {}", node.op.name(), node.key))
            })
    };
    let data_error = |e: common::DataError| {
        RemoteError::new("ValueError", e.to_string())
            .with_frame(format!("operand {} of tileable {}", node.op.name(), node.key))
    };

    match &node.op {
        Operand::Ones { shape, chunk_size } => Ok(tile(Tensor::ones(shape), *chunk_size)),
        Operand::FromTensor { value, chunk_size } => Ok(tile(value.clone(), *chunk_size)),
        Operand::AddScalar { value } => {
            let source = input(0)?;
            Ok(Materialized {
                shape: source.shape.clone(),
                chunks: source
                    .chunks
                    .iter()
                    .map(|(index, t)| (index.clone(), t.add_scalar(*value)))
                    .collect(),
            })
        }
        Operand::Index { indexes } => {
            let source = input(0)?;
            let pieces = source
                .chunks
                .iter()
                .map(|(index, t)| (index.clone(), ChunkData::Tensor(t.clone())))
                .collect();
            let whole = merge_chunks(pieces)
                .and_then(ChunkData::into_tensor)
                .map_err(data_error)?;
            let selected = whole.index(indexes).map_err(data_error)?;
            let index = vec![0; selected.ndim()];
            Ok(Materialized {
                shape: selected.shape().to_vec(),
                chunks: vec![(index, selected)],
            })
        }
        Operand::Fail { kind, message } => {
            let source = input(0)?;
            let first = source
                .chunks
                .first()
                .map(|(index, _)| format!("{index:?}"))
                .unwrap_or_default();
            warn!("Operand Fail of {} raised {}", node.key, kind);
            Err(RemoteError::new(kind.clone(), message.clone())
                .with_frame(format!("operand Fail of tileable {}", node.key))
                .with_frame(format!("executing chunk {first}")))
        }
    }
}

/// Splits `tensor` into blocks of at most `chunk_size` along every axis.
fn tile(tensor: Tensor, chunk_size: usize) -> Materialized {
    let shape = tensor.shape().to_vec();
    let chunk_size = chunk_size.max(1);
    let grid: Vec<usize> = shape
        .iter()
        .map(|size| size.div_ceil(chunk_size).max(1))
        .collect();

    let mut chunks = Vec::new();
    let mut cursor = vec![0usize; grid.len()];
    loop {
        let offsets: Vec<usize> = cursor.iter().map(|c| c * chunk_size).collect();
        let extents: Vec<usize> = offsets
            .iter()
            .zip(&shape)
            .map(|(offset, size)| chunk_size.min(size - offset))
            .collect();
        chunks.push((cursor.clone(), tensor.block(&offsets, &extents)));

        let mut axis = grid.len();
        loop {
            if axis == 0 {
                return Materialized { shape, chunks };
            }
            axis -= 1;
            cursor[axis] += 1;
            if cursor[axis] < grid[axis] {
                break;
            }
            cursor[axis] = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_uneven_blocks() {
        let tiled = tile(Tensor::ones(&[5, 4]), 3);
        let indexes: Vec<ChunkIndex> = tiled.chunks.iter().map(|(i, _)| i.clone()).collect();
        assert_eq!(indexes, vec![vec![0, 0], vec![0, 1], vec![1, 0], vec![1, 1]]);
        let shapes: Vec<Vec<usize>> = tiled
            .chunks
            .iter()
            .map(|(_, t)| t.shape().to_vec())
            .collect();
        assert_eq!(shapes, vec![vec![3, 3], vec![3, 1], vec![2, 3], vec![2, 1]]);
    }

    #[test]
    fn test_tile_scalar() {
        let tiled = tile(Tensor::full(&[], 7.0), 4);
        assert_eq!(tiled.chunks.len(), 1);
        assert!(tiled.chunks[0].0.is_empty());
    }

    #[test]
    fn test_fail_operand_raises_with_traceback() {
        let base = common::Tileable::ones(&[2], 2);
        let failing = base.fail("TypeError", "bad operand");
        let graph = TileableGraph::build(&[failing]);
        let mut computed = HashMap::new();
        let ones = compute(&graph.nodes[0], &computed).unwrap();
        computed.insert(graph.nodes[0].key.clone(), ones);
        let err = compute(&graph.nodes[1], &computed).err().unwrap();
        assert_eq!(err.kind, "TypeError");
        assert_eq!(err.traceback.len(), 2);
    }
}

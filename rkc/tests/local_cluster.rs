use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{ChunkData, ChunkKey, IndexItem, StorageLevel, Tileable, TileableGraph};
use liblifecycle::{ChunkRemover, gen_uid, spawn_tracker};
use libsession::{ExecuteOptions, ExecutionInfo, SessionApi, SessionError, TaskApi};
use libstorage::{ClusterDirectory, InMemoryMetaApi, StorageApiCache};
use rkc::{Config, LocalCluster, LocalTaskService};
use tokio::time::timeout;

fn config() -> Config {
    let mut cfg = Config {
        addr: "127.0.0.1:0".to_string(),
        ..Default::default()
    };
    cfg.session.poll_interval_ms = 10;
    cfg.session.wait_timeout_ms = 10;
    cfg
}

async fn finish(info: &ExecutionInfo) -> Result<(), SessionError> {
    timeout(Duration::from_secs(10), info.wait())
        .await
        .expect("task did not finish in time")
}

fn tensor(data: &ChunkData) -> &common::Tensor {
    data.as_tensor().expect("tensor result")
}

async fn stored_chunks(cluster: &LocalCluster, session_id: &str) -> usize {
    let mut total = 0;
    for node in cluster.nodes() {
        total += node.keys(session_id).await.len();
    }
    total
}

#[tokio::test]
async fn test_execute_add_and_fetch() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();

    let t = Tileable::ones(&[10, 10], 5).add(1.0);
    let info = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&info).await.unwrap();
    assert_eq!(info.progress(), 1.0);
    assert_eq!(t.shape(), vec![Some(10), Some(10)]);

    let values = session.fetch(&[t.clone()]).await.unwrap();
    let value = tensor(&values[0]);
    assert_eq!(value.shape(), &[10, 10]);
    assert!(value.data().iter().all(|v| *v == 2.0));

    // four 5x5 chunks spread over both nodes
    assert_eq!(stored_chunks(&cluster, session.session_id()).await, 4);
    for node in cluster.nodes() {
        assert_eq!(node.keys(session.session_id()).await.len(), 2);
    }
    let counts = session.get_ref_counts().await.unwrap();
    assert_eq!(counts.len(), 4);
    assert!(counts.values().all(|c| *c == 1));

    let again = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    assert!(again.is_done());
    assert_eq!(again.task_id(), info.task_id());

    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_remote_type_error_surfaces() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();

    let t = Tileable::ones(&[4], 2)
        .add(1.0)
        .fail("TypeError", "unsupported operand type(s) for +");
    let info = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    let err = finish(&info).await.unwrap_err();
    let cause = err.remote_cause().expect("remote cause");
    assert_eq!(cause.kind, "TypeError");
    assert!(cause.message.contains("unsupported operand"));
    assert!(!cause.traceback.is_empty());
    assert!(matches!(
        session.fetch(&[t]).await,
        Err(SessionError::NotExecuted(_))
    ));

    // nothing of the failed task was kept
    assert_eq!(stored_chunks(&cluster, session.session_id()).await, 0);
}

#[tokio::test]
async fn test_fetch_slices() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();

    let base = Tileable::ones(&[10, 10], 5).add(1.0);
    let info = session
        .execute(&[base.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&info).await.unwrap();

    let row = base.index(vec![IndexItem::range(0, 5), IndexItem::Int(1)]);
    let corner = base
        .index(vec![IndexItem::range(2, 8), IndexItem::range(2, 8)])
        .index(vec![IndexItem::Int(0)]);
    let values = session.fetch(&[row, corner]).await.unwrap();
    assert_eq!(tensor(&values[0]).shape(), &[5]);
    assert_eq!(tensor(&values[1]).shape(), &[6]);
    assert!(tensor(&values[1]).data().iter().all(|v| *v == 2.0));

    let fancy = base.index(vec![IndexItem::Array(vec![1, 3])]);
    assert!(matches!(
        session.fetch(&[fancy]).await,
        Err(SessionError::UnsupportedFetch(_))
    ));

    let never = Tileable::ones(&[3], 3);
    match session.fetch(&[never.clone()]).await {
        Err(SessionError::NotExecuted(key)) => assert_eq!(&key, never.key()),
        other => panic!("expected NotExecuted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_executed_index_is_a_single_chunk() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();

    let masked = Tileable::ones(&[6], 2).index(vec![IndexItem::Mask(vec![
        true, false, true, false, true, true,
    ])]);
    assert_eq!(masked.shape(), vec![None]);
    let info = session
        .execute(&[masked.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&info).await.unwrap();
    assert_eq!(masked.shape(), vec![Some(4)]);

    let fetch = session.fetch_tileable(&masked).await.unwrap();
    assert_eq!(fetch.chunks.len(), 1);
    let values = session.fetch(&[masked]).await.unwrap();
    assert_eq!(tensor(&values[0]).data(), &[1.0, 1.0, 1.0, 1.0]);
}

#[tokio::test]
async fn test_destroy_frees_everything() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(Some("doomed".to_string())).await.unwrap();
    let t = Tileable::ones(&[8, 8], 4).add(2.0);
    let info = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&info).await.unwrap();
    assert_eq!(stored_chunks(&cluster, "doomed").await, 4);

    session.destroy().await.unwrap();
    assert_eq!(stored_chunks(&cluster, "doomed").await, 0);
    assert!(cluster.meta().get("doomed").await.is_err());

    let service = cluster.session_service();
    assert!(service.get_sessions().await.unwrap().is_empty());
    assert!(matches!(
        service.delete_session("doomed").await,
        Err(SessionError::UnknownSession(id)) if id == "doomed"
    ));
    assert!(matches!(
        session.fetch(&[t]).await,
        Err(SessionError::Closed(_))
    ));
}

#[tokio::test]
async fn test_handle_release_and_drop() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();
    let id = session.session_id().to_string();

    let kept = Tileable::ones(&[4], 2).add(1.0);
    let released = Tileable::ones(&[4], 2).add(3.0);
    let dropped = Tileable::ones(&[4], 2).add(5.0);
    let info = session
        .execute(
            &[kept.clone(), released.clone(), dropped.clone()],
            ExecuteOptions::default(),
        )
        .await
        .unwrap();
    finish(&info).await.unwrap();
    assert_eq!(stored_chunks(&cluster, &id).await, 6);

    let first = session.own(&released);
    let second = session.own(&released);
    first.release().await.unwrap();
    assert_eq!(stored_chunks(&cluster, &id).await, 6);
    second.release().await.unwrap();
    assert_eq!(stored_chunks(&cluster, &id).await, 4);
    assert!(matches!(
        session.fetch(&[released]).await,
        Err(SessionError::NotExecuted(_))
    ));

    drop(session.own(&dropped));
    // dropping only queues the release; the next call flushes it
    assert_eq!(stored_chunks(&cluster, &id).await, 4);
    let values = session.fetch(&[kept]).await.unwrap();
    assert_eq!(tensor(&values[0]).data(), &[2.0; 4]);
    assert_eq!(stored_chunks(&cluster, &id).await, 2);
    assert!(matches!(
        session.fetch(&[dropped]).await,
        Err(SessionError::NotExecuted(_))
    ));
}

#[tokio::test]
async fn test_sessions_are_isolated() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let left = cluster.session(Some("left".to_string())).await.unwrap();
    let right = cluster.session(Some("right".to_string())).await.unwrap();

    let t = Tileable::ones(&[6], 3).add(1.0);
    for session in [&left, &right] {
        let info = session
            .execute(&[t.clone()], ExecuteOptions::default())
            .await
            .unwrap();
        finish(&info).await.unwrap();
    }
    assert_eq!(
        cluster.session_service().get_sessions().await.unwrap(),
        vec!["left".to_string(), "right".to_string()]
    );

    left.destroy().await.unwrap();
    assert_eq!(stored_chunks(&cluster, "left").await, 0);
    assert_eq!(stored_chunks(&cluster, "right").await, 2);
    let values = right.fetch(&[t]).await.unwrap();
    assert_eq!(tensor(&values[0]).data(), &[2.0; 6]);
}

#[tokio::test]
async fn test_fetch_through_web_tunnel() {
    let mut cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.web_session(None).await.unwrap();

    let t = Tileable::ones(&[6, 4], 3).add(0.5);
    let info = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&info).await.unwrap();

    let values = session
        .fetch(&[t.clone(), t.index(vec![IndexItem::Int(5)])])
        .await
        .unwrap();
    assert_eq!(tensor(&values[0]).shape(), &[6, 4]);
    assert_eq!(tensor(&values[1]).data(), &[1.5; 4]);

    session.destroy().await.unwrap();
    cluster.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_executes_hold_one_reference() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(None).await.unwrap();
    let id = session.session_id().to_string();

    let t = Tileable::ones(&[4], 2).add(7.0);
    let first = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    let second = session
        .execute(&[t.clone()], ExecuteOptions::default())
        .await
        .unwrap();
    finish(&first).await.unwrap();
    finish(&second).await.unwrap();

    let counts = session.get_ref_counts().await.unwrap();
    assert_eq!(counts.len(), 2);
    assert!(counts.values().all(|c| *c == 1));
    assert_eq!(stored_chunks(&cluster, &id).await, 2);

    session.own(&t).release().await.unwrap();
    assert!(session.get_ref_counts().await.unwrap().is_empty());
    assert_eq!(stored_chunks(&cluster, &id).await, 0);
    assert!(matches!(
        session.fetch(&[t]).await,
        Err(SessionError::NotExecuted(_))
    ));
}

#[tokio::test]
async fn test_cluster_needs_nodes() {
    let mut cfg = config();
    cfg.nodes.clear();
    assert!(LocalCluster::new(&cfg).is_err());
}

#[tokio::test]
async fn test_task_without_nodes_fails_instead_of_hanging() {
    let session_id = "nodeless";
    let meta = Arc::new(InMemoryMetaApi::new(session_id));
    let storage = Arc::new(StorageApiCache::new(Arc::new(ClusterDirectory::default()), 4));
    let lifecycle = spawn_tracker(
        gen_uid(session_id),
        ChunkRemover::new(session_id, meta.clone(), storage.clone()),
    );
    let tasks = LocalTaskService::new(session_id, Vec::new(), meta, storage, lifecycle);

    let graph = TileableGraph::build(&[Tileable::ones(&[2], 1)]);
    let task_id = tasks
        .submit_tileable_graph(graph, None, false, HashMap::new())
        .await
        .unwrap();
    let result = tasks
        .wait_task(&task_id, Duration::from_secs(5))
        .await
        .unwrap()
        .expect("terminal result");
    let error = result.error.expect("task must fail");
    assert_eq!(error.kind, "StorageError");
    assert_eq!(tasks.get_task_progress(&task_id).await.unwrap(), 1.0);
}

#[tokio::test]
async fn test_delete_session_purges_untracked_objects() {
    let cluster = LocalCluster::new(&config()).unwrap();
    let session = cluster.session(Some("leaky".to_string())).await.unwrap();

    // as left behind by a task aborted between put and track
    cluster.nodes()[0]
        .put(
            "leaky",
            &ChunkKey::from("orphan"),
            common::Tensor::ones(&[3]).into(),
            StorageLevel::Memory,
        )
        .await
        .unwrap();
    assert_eq!(stored_chunks(&cluster, "leaky").await, 1);

    session.destroy().await.unwrap();
    assert_eq!(stored_chunks(&cluster, "leaky").await, 0);
}

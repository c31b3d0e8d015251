//! Integration tests for the platform core.
//!
//! These tests exercise the public API end to end:
//! - instance choreography over the coordination service (HTTP transport)
//! - the durable task engine driving the orchestrator
//! - task state durability across a daemon restart

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use testground::rpc::{Chunk, OutputWriter};
use testground::sync::{sync_router, Subtree, SyncApi, SyncClient, SyncStore};
use testground::task::{
    Task, TaskDispatcher, TaskEngine, TaskEngineConfig, TaskOutcome, TaskState, TaskStorage,
    TaskType,
};

// =============================================================================
// Test Helpers
// =============================================================================

async fn spawn_sync_service() -> (String, CancellationToken) {
    let store = Arc::new(SyncStore::new());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        axum::serve(listener, sync_router(store))
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .ok();
    });
    (format!("http://{}", addr), token)
}

#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
struct PeerRecord {
    instance: String,
    addr: String,
}

/// One simulated ping-pong instance: publish our address, learn the
/// peer's, signal readiness, wait for everyone, then exchange one
/// message through a per-instance topic.
async fn ping_pong_instance(
    endpoint: String,
    run_id: String,
    me: String,
    total: u64,
) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let client = SyncClient::new(&endpoint)?;
    let token = CancellationToken::new();

    let peers = Subtree::<PeerRecord>::new("peers", |r| r.instance.clone());

    // Subscribe before publishing so history replay is exercised on one
    // side and live tailing on the other.
    let mut peer_rx =
        testground::sync::subscribe_typed(&client, &run_id, &peers, &token).await?;

    testground::sync::publish_typed(
        &client,
        &run_id,
        &peers,
        &PeerRecord {
            instance: me.clone(),
            addr: format!("/ip4/127.0.0.1/tcp/{}", me.len() + 9000),
        },
    )
    .await?;

    // Learn every peer, ourselves included.
    let mut other: Option<PeerRecord> = None;
    for _ in 0..total {
        let record = tokio::time::timeout(Duration::from_secs(10), peer_rx.recv())
            .await?
            .ok_or("peer stream closed early")?;
        if record.instance != me {
            other = Some(record);
        }
    }
    let other = other.ok_or("never saw the other instance")?;

    client.signal_entry(&run_id, "ready").await?;
    client.barrier(&run_id, "ready", total, &token).await?;

    // Ping the peer's mailbox; read our own.
    client
        .publish(
            &run_id,
            &format!("mailbox:{}", other.instance),
            serde_json::json!({ "from": me, "msg": "ping" }),
        )
        .await?;

    let mut mailbox = client
        .subscribe(&run_id, &format!("mailbox:{}", me), &token)
        .await?;
    let message = tokio::time::timeout(Duration::from_secs(10), mailbox.recv())
        .await?
        .ok_or("mailbox closed early")?;

    token.cancel();
    Ok(message["from"].as_str().unwrap_or_default().to_string())
}

// =============================================================================
// Coordination service end to end
// =============================================================================

#[tokio::test]
async fn test_two_instances_choreograph_a_ping_pong() {
    let (endpoint, shutdown) = spawn_sync_service().await;

    let a = tokio::spawn(ping_pong_instance(
        endpoint.clone(),
        "r-e2e".to_string(),
        "alpha".to_string(),
        2,
    ));
    let b = tokio::spawn(ping_pong_instance(
        endpoint.clone(),
        "r-e2e".to_string(),
        "bravo".to_string(),
        2,
    ));

    let from_a = a.await.unwrap().unwrap();
    let from_b = b.await.unwrap().unwrap();

    // Each instance received the other's ping.
    assert_eq!(from_a, "bravo");
    assert_eq!(from_b, "alpha");
    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_signals_over_http_are_gap_free() {
    let (endpoint, shutdown) = spawn_sync_service().await;

    let mut handles = Vec::new();
    for _ in 0..10 {
        let endpoint = endpoint.clone();
        handles.push(tokio::spawn(async move {
            let client = SyncClient::new(&endpoint).unwrap();
            client.signal_entry("r-seq", "s").await.unwrap()
        }));
    }

    let mut seqs = Vec::new();
    for h in handles {
        seqs.push(h.await.unwrap());
    }
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
    shutdown.cancel();
}

#[tokio::test]
async fn test_runs_do_not_contaminate_each_other() {
    let (endpoint, shutdown) = spawn_sync_service().await;
    let client = SyncClient::new(&endpoint).unwrap();
    let token = CancellationToken::new();

    client
        .publish("r-one", "peers", serde_json::json!("from-run-one"))
        .await
        .unwrap();

    // A subscriber on a different run with the same topic sees nothing.
    let mut rx = client.subscribe("r-two", "peers", &token).await.unwrap();
    let nothing = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(nothing.is_err());

    // And counters are independent per run.
    assert_eq!(client.signal_entry("r-one", "s").await.unwrap(), 1);
    assert_eq!(client.signal_entry("r-two", "s").await.unwrap(), 1);

    token.cancel();
    shutdown.cancel();
}

// =============================================================================
// Task engine end to end
// =============================================================================

struct SleepyDispatcher {
    order: parking_lot::Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl TaskDispatcher for SleepyDispatcher {
    async fn dispatch(
        &self,
        task: &Task,
        ow: &OutputWriter,
        token: CancellationToken,
    ) -> Result<serde_json::Value, Box<dyn std::error::Error + Send + Sync>> {
        self.order.lock().push(task.plan.clone());
        ow.info("processing", &[("plan", &task.plan)]);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(30)) => {}
            _ = token.cancelled() => {}
        }
        Ok(serde_json::json!({ "plan": task.plan }))
    }
}

#[tokio::test]
async fn test_priorities_govern_processing_order() {
    let engine = TaskEngine::new(Arc::new(TaskStorage::in_memory().unwrap()));
    let dispatcher = Arc::new(SleepyDispatcher {
        order: parking_lot::Mutex::new(Vec::new()),
    });
    let shutdown = CancellationToken::new();

    // A, B, C with priorities 1, 5, 1: B first, then A, then C.
    let ids = [
        engine.submit(TaskType::Build, 1, "a", None, serde_json::json!({})).unwrap(),
        engine.submit(TaskType::Build, 5, "b", None, serde_json::json!({})).unwrap(),
        engine.submit(TaskType::Build, 1, "c", None, serde_json::json!({})).unwrap(),
    ];

    engine
        .start(
            TaskEngineConfig { workers: 1 },
            dispatcher.clone(),
            shutdown.clone(),
        )
        .unwrap();

    for id in &ids {
        for _ in 0..300 {
            if engine.status(id).unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            engine.status(id).unwrap().outcome,
            Some(TaskOutcome::Success)
        );
    }

    assert_eq!(*dispatcher.order.lock(), vec!["b", "a", "c"]);
    shutdown.cancel();
}

#[tokio::test]
async fn test_log_stream_replays_and_terminates() {
    let engine = TaskEngine::new(Arc::new(TaskStorage::in_memory().unwrap()));
    let dispatcher = Arc::new(SleepyDispatcher {
        order: parking_lot::Mutex::new(Vec::new()),
    });
    let shutdown = CancellationToken::new();
    engine
        .start(TaskEngineConfig { workers: 1 }, dispatcher, shutdown.clone())
        .unwrap();

    let id = engine
        .submit(TaskType::Build, 0, "p", None, serde_json::json!({}))
        .unwrap();

    for _ in 0..300 {
        if engine.status(&id).unwrap().is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Replay after completion: progress chunks then one result.
    let mut rx = engine.logs(&id, false).unwrap();
    let mut chunks = Vec::new();
    while let Ok(chunk) = rx.try_recv() {
        chunks.push(chunk);
    }
    assert!(chunks.len() >= 2);
    assert!(matches!(chunks.last(), Some(Chunk::Result(_))));
    shutdown.cancel();
}

// =============================================================================
// Durability across restarts
// =============================================================================

#[tokio::test]
async fn test_task_state_survives_restart_under_exactly_one_prefix() {
    let tmp = tempfile::TempDir::new().unwrap();
    let path = tmp.path().join("tasks.db");

    let build_id;
    let run_id;
    {
        let storage = Arc::new(TaskStorage::open(&path).unwrap());
        let engine = TaskEngine::new(storage);
        build_id = engine
            .submit(TaskType::Build, 0, "b", None, serde_json::json!({}))
            .unwrap();
        run_id = engine
            .submit(TaskType::Run, 0, "r", None, serde_json::json!({}))
            .unwrap();

        // Simulate a crash mid-processing: both tasks claimed, never
        // completed.
        let storage = TaskStorage::open(&path).unwrap();
        storage
            .transition(&build_id, TaskState::Scheduled, TaskState::Processing, |_| {})
            .unwrap();
        storage
            .transition(&run_id, TaskState::Scheduled, TaskState::Processing, |_| {})
            .unwrap();
    }

    // "Restart": a fresh engine over the same file recovers state.
    let storage = Arc::new(TaskStorage::open(&path).unwrap());
    let engine = TaskEngine::new(Arc::clone(&storage));
    let shutdown = CancellationToken::new();
    engine
        .start(
            TaskEngineConfig { workers: 0 },
            Arc::new(SleepyDispatcher {
                order: parking_lot::Mutex::new(Vec::new()),
            }),
            shutdown.clone(),
        )
        .unwrap();

    // The idempotently restartable build went back to scheduled; the
    // interrupted run was archived as failed.
    let build = engine.status(&build_id).unwrap();
    assert_eq!(build.state, TaskState::Scheduled);

    let run = engine.status(&run_id).unwrap();
    assert_eq!(run.state, TaskState::Complete);
    assert_eq!(run.outcome, Some(TaskOutcome::Failure));

    // Exactly one prefix holds each key.
    let mut homes = 0;
    for state in [TaskState::Scheduled, TaskState::Processing, TaskState::Complete] {
        homes += storage
            .list(state)
            .unwrap()
            .iter()
            .filter(|t| t.id == build_id)
            .count();
    }
    assert_eq!(homes, 1);
    shutdown.cancel();
}

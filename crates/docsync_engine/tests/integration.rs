//! Integration tests for sync engines against an in-process server.

mod common;

use common::{client, payload, transport, wait_until_acked, InProcessServer};
use docsync_engine::{EngineState, SyncTransport};
use docsync_protocol::{ChangeId, CursorRepresentation, IndexMode, NewChange};
use docsync_server::{DataDir, HandlerContext, ServerConfig};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

#[tokio::test]
async fn three_clients_end_to_end() {
    let server = InProcessServer::in_memory(ServerConfig::default());
    let link = transport(&server);

    // A writes.
    let a = client("a", link.clone());
    a.bootstrap().await.unwrap();
    a.start();
    a.apply_mutation(payload(json!({"balance": 100})))
        .await
        .unwrap();
    wait_until_acked(&a).await;

    // B pulls it.
    let b = client("b", link.clone());
    b.bootstrap().await.unwrap();
    b.pull().await.unwrap();
    assert_eq!(b.read("balance").await, Some(json!(100)));

    // Compaction folds the log.
    let report = link.compact().await.unwrap();
    assert_eq!(report.folded_count, 1);

    // A fresh client starts from the snapshot.
    let c = client("c", link.clone());
    assert_eq!(c.bootstrap().await.unwrap(), EngineState::Bootstrapped);
    assert_eq!(c.read("balance").await, Some(json!(100)));
    assert_eq!(
        c.cursor().await,
        CursorRepresentation::CountForm(report.compacted_through.as_u64())
    );

    // B keeps pulling across the compaction without losing anything.
    let outcome = b.pull().await.unwrap();
    assert!(!outcome.resynced);
    assert_eq!(b.read("balance").await, Some(json!(100)));

    a.shutdown().await;
}

#[tokio::test]
async fn resubmission_is_idempotent() {
    let server = InProcessServer::in_memory(ServerConfig::default());
    let link = transport(&server);
    let change = NewChange::new(ChangeId::new("x1").unwrap(), payload(json!({"a": 1})));

    let first = link.submit(&change).await.unwrap();
    let second = link.submit(&change).await.unwrap();

    assert!(!first.duplicated);
    assert!(second.duplicated);
    assert_eq!(first.sequence_token, second.sequence_token);
    assert_eq!(server.handler().context().changes().len(), 1);
}

#[tokio::test]
async fn resubmission_after_compaction_is_still_a_duplicate() {
    let server = InProcessServer::in_memory(ServerConfig::default());
    let link = transport(&server);
    let change = NewChange::new(ChangeId::new("x1").unwrap(), payload(json!({"a": 1})));

    link.submit(&change).await.unwrap();
    link.compact().await.unwrap();
    let again = link.submit(&change).await.unwrap();

    assert!(again.duplicated);
    let fresh = client("fresh", link.clone());
    fresh.pull().await.unwrap();
    assert_eq!(fresh.document().await, payload(json!({"a": 1})));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_and_compaction_lose_nothing() {
    let server = InProcessServer::in_memory(ServerConfig::default());
    let link = transport(&server);

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let engine = Arc::new(client(&format!("writer-{w}"), link.clone()));
            engine.start();
            engine
        })
        .collect();

    let compactor = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            for _ in 0..20 {
                let handler = server.handler();
                tokio::task::spawn_blocking(move || handler.handle_compact())
                    .await
                    .unwrap()
                    .unwrap();
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let mut tasks = Vec::new();
    for (w, engine) in writers.iter().enumerate() {
        let engine = Arc::clone(engine);
        tasks.push(tokio::spawn(async move {
            for i in 0..30 {
                let mut change = serde_json::Map::new();
                change.insert(format!("w{w}-k{i}"), json!(i));
                engine.apply_mutation(change).await.unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    compactor.await.unwrap();
    for engine in &writers {
        wait_until_acked(engine).await;
    }

    link.compact().await.unwrap();
    let reader = client("reader", link.clone());
    reader.pull().await.unwrap();
    let document = reader.document().await;
    assert_eq!(document.len(), 90);

    let expected: HashSet<String> = (0..3)
        .flat_map(|w| (0..30).map(move |i| format!("w{w}-k{i}")))
        .collect();
    let actual: HashSet<String> = document.keys().cloned().collect();
    assert_eq!(actual, expected);

    for engine in &writers {
        engine.shutdown().await;
    }
}

#[tokio::test]
async fn counter_index_never_yields_changes() {
    let server = InProcessServer::in_memory(
        ServerConfig::default().with_index_mode(IndexMode::Counter),
    );
    let link = transport(&server);
    link.submit(&NewChange::new(
        ChangeId::new("x1").unwrap(),
        payload(json!({"a": 1})),
    ))
    .await
    .unwrap();

    for cursor in [
        CursorRepresentation::ListForm(Vec::new()),
        CursorRepresentation::CountForm(0),
    ] {
        let batch = link.pull(&cursor, 10).await.unwrap();
        assert!(batch.response.snapshot_needed);
        assert!(batch.response.changes.is_empty());
        assert_eq!(batch.response.index_mode, IndexMode::Counter);
    }

    // The engine still converges through the snapshot.
    let engine = client("counter", link.clone());
    engine.pull().await.unwrap();
    assert_eq!(engine.read("a").await, Some(json!(1)));
}

#[tokio::test]
async fn list_cursor_client_migrates_to_count_form() {
    let server = InProcessServer::in_memory(ServerConfig::default());
    let link = transport(&server);
    for (id, value) in [("x1", json!({"a": 1})), ("x2", json!({"b": 2}))] {
        link.submit(&NewChange::new(ChangeId::new(id).unwrap(), payload(value)))
            .await
            .unwrap();
    }

    // A legacy client that has seen x1 only.
    let mut legacy = docsync_engine::LocalDocument::new();
    legacy.state = payload(json!({"a": 1}));
    legacy.cursor = CursorRepresentation::ListForm(vec![ChangeId::new("x1").unwrap()]);
    let engine = docsync_engine::SyncEngine::new(
        common::client_config("legacy"),
        link.clone(),
        Arc::new(docsync_engine::MemoryDocumentStore::with_document(legacy)),
    )
    .unwrap();

    assert_eq!(engine.bootstrap().await.unwrap(), EngineState::Bootstrapped);
    let outcome = engine.pull().await.unwrap();
    assert_eq!(outcome.merged, 1);
    assert_eq!(engine.document().await, payload(json!({"a": 1, "b": 2})));
    assert_eq!(engine.cursor().await, CursorRepresentation::CountForm(2));
}

#[tokio::test]
async fn index_migration_forces_one_resync() {
    let dir = tempdir().unwrap();
    let config = ServerConfig::default().with_data_dir(dir.path());
    let server = InProcessServer::new(HandlerContext::open(config.clone()).unwrap());
    let link = transport(&server);

    let engine = client("migrating", link.clone());
    link.submit(&NewChange::new(
        ChangeId::new("x1").unwrap(),
        payload(json!({"a": 1})),
    ))
    .await
    .unwrap();
    engine.pull().await.unwrap();
    assert_eq!(engine.index_mode(), Some(IndexMode::Ids));

    // Restart the server in counter mode.
    let old = server.restart(HandlerContext::in_memory(ServerConfig::default()));
    drop(old);
    let previous = DataDir::open(dir.path())
        .unwrap()
        .set_index_mode(IndexMode::Counter)
        .unwrap();
    assert_eq!(previous, IndexMode::Ids);
    server.restart(HandlerContext::open(config).unwrap());

    link.submit(&NewChange::new(
        ChangeId::new("x2").unwrap(),
        payload(json!({"b": 2})),
    ))
    .await
    .unwrap();

    let outcome = engine.pull().await.unwrap();
    assert!(outcome.resynced);
    assert_eq!(engine.index_mode(), Some(IndexMode::Counter));
    assert_eq!(engine.document().await, payload(json!({"a": 1, "b": 2})));
    assert_eq!(engine.stats().resyncs, 1);
}

#[tokio::test]
async fn file_backed_server_survives_restart() {
    let dir = tempdir().unwrap();
    let config = ServerConfig::default().with_data_dir(dir.path());
    let server = InProcessServer::new(HandlerContext::open(config.clone()).unwrap());
    let link = transport(&server);

    let writer = client("writer", link.clone());
    writer.bootstrap().await.unwrap();
    writer.start();
    writer
        .apply_mutation(payload(json!({"title": "draft"})))
        .await
        .unwrap();
    wait_until_acked(&writer).await;
    writer.shutdown().await;
    link.compact().await.unwrap();

    let old = server.restart(HandlerContext::in_memory(ServerConfig::default()));
    drop(old);
    server.restart(HandlerContext::open(config).unwrap());

    let reader = client("reader", link.clone());
    reader.bootstrap().await.unwrap();
    assert_eq!(reader.read("title").await, Some(json!("draft")));
}

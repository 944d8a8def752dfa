//! End-to-end tests of the HTTP surface over a loopback socket.

use docsync_protocol::{
    BootstrapResponse, CompactResponse, CursorRepresentation, ErrorResponse, PullResponse,
    SubmitResponse,
};
use docsync_server::{RunningServer, ServerConfig, SyncServer};
use serde_json::json;

async fn start() -> (RunningServer, String) {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
    let running = SyncServer::new(config).spawn().await.unwrap();
    let base = format!("http://{}", running.local_addr());
    (running, base)
}

async fn pull(client: &reqwest::Client, base: &str, cursor: &CursorRepresentation) -> PullResponse {
    client
        .get(format!("{base}/changes"))
        .query(&[("cursor", cursor.to_query_value())])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn submit_pull_compact_bootstrap() {
    let (running, base) = start().await;
    let client = reqwest::Client::new();

    let empty: BootstrapResponse = client
        .get(format!("{base}/bootstrap"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(empty.ok);
    assert!(empty.snapshot.is_none());

    let body = json!({"id": "x1", "payload": {"balance": 100}});
    let first: SubmitResponse = client
        .post(format!("{base}/changes"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let second: SubmitResponse = client
        .post(format!("{base}/changes"))
        .json(&body)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(!first.duplicated);
    assert!(second.duplicated);

    let delta = pull(&client, &base, &CursorRepresentation::beginning()).await;
    assert_eq!(delta.changes.len(), 1);
    assert_eq!(delta.changes[0].payload["balance"], 100);
    assert_eq!(delta.new_cursor, CursorRepresentation::CountForm(1));

    let compact: CompactResponse = client
        .post(format!("{base}/compact"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(compact.folded_count, 1);

    let snapshot = client
        .get(format!("{base}/bootstrap"))
        .send()
        .await
        .unwrap()
        .json::<BootstrapResponse>()
        .await
        .unwrap()
        .snapshot
        .unwrap();
    assert_eq!(snapshot.state["balance"], 100);
    assert_eq!(snapshot.compacted_through.as_u64(), 1);

    let stale = pull(&client, &base, &CursorRepresentation::beginning()).await;
    assert!(stale.snapshot_needed);
    assert!(stale.changes.is_empty());

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn list_cursor_over_query_string() {
    let (running, base) = start().await;
    let client = reqwest::Client::new();

    for id in ["a,1", "b"] {
        client
            .post(format!("{base}/changes"))
            .json(&json!({"id": id, "payload": {"k": id}}))
            .send()
            .await
            .unwrap()
            .error_for_status()
            .unwrap();
    }

    let seen = CursorRepresentation::ListForm(vec![docsync_protocol::ChangeId::new("a,1").unwrap()]);
    let delta = pull(&client, &base, &seen).await;
    assert_eq!(delta.changes.len(), 1);
    assert_eq!(delta.changes[0].id.as_str(), "b");
    assert_eq!(delta.new_cursor, CursorRepresentation::CountForm(2));

    running.shutdown().await.unwrap();
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let (running, base) = start().await;
    let client = reqwest::Client::new();

    let bad_cursor = client
        .get(format!("{base}/changes?cursor=yesterday"))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_cursor.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: ErrorResponse = bad_cursor.json().await.unwrap();
    assert!(!body.ok);
    assert!(body.error.contains("cursor"));

    let reserved = client
        .post(format!("{base}/changes"))
        .json(&json!({"id": "__compaction__:9", "payload": {}}))
        .send()
        .await
        .unwrap();
    assert_eq!(reserved.status(), reqwest::StatusCode::BAD_REQUEST);

    let not_an_object = client
        .post(format!("{base}/changes"))
        .json(&json!({"id": "x", "payload": [1, 2]}))
        .send()
        .await
        .unwrap();
    assert_eq!(not_an_object.status(), reqwest::StatusCode::BAD_REQUEST);

    running.shutdown().await.unwrap();
}

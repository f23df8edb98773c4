//! End-to-end WebSocket subscriber tests against a real server.

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMsg;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use logstat::handlers::AppState;
use logstat::hub::{Hub, HubConfig};
use logstat::model::RawLogEntry;
use logstat::server::create_router;
use logstat::store::db::DurableSink;
use logstat::store::{StatStore, StoreOptions};

struct TestServer {
    addr: SocketAddr,
    hub: Hub,
    _shutdown_tx: broadcast::Sender<()>,
    _dir: tempfile::TempDir,
}

async fn spawn_server(max_clients: usize) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let sink = DurableSink::new(dir.path().join("stats.db"));
    sink.init().await.unwrap();

    let store = Arc::new(StatStore::new(
        sink,
        StoreOptions {
            bucket_size: chrono::Duration::minutes(1),
            utc_buckets: true,
            retain_on_flush_error: false,
        },
    ));

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let hub = Hub::spawn(
        &HubConfig {
            max_clients,
            broadcast_capacity: 64,
            session_queue_capacity: 32,
        },
        shutdown_rx,
    );

    let recorder = PrometheusBuilder::new().build_recorder();
    let state = AppState {
        store,
        hub: hub.clone(),
        metrics_handle: Arc::new(recorder.handle()),
    };

    let app = create_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        hub,
        _shutdown_tx: shutdown_tx,
        _dir: dir,
    }
}

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _resp) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn next_frame(ws: &mut WsClient) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("websocket error");
        if let WsMsg::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(WsMsg::Text(value.to_string().into())).await.unwrap();
}

fn entry(level: &str, message: &str) -> RawLogEntry {
    RawLogEntry {
        timestamp: Utc::now(),
        host: "h1".into(),
        logger: "app.A".into(),
        level: level.into(),
        message: message.into(),
        stack_trace: String::new(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn subscribe_filter_and_receive() {
    let server = spawn_server(4).await;

    let mut errors_only = connect(server.addr).await;
    send_json(
        &mut errors_only,
        json!({"action": "subscribe", "data": {"levels": ["ERROR"]}}),
    )
    .await;
    let ack = next_frame(&mut errors_only).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["data"]["message"], "subscribed");

    let mut no_noise = connect(server.addr).await;
    send_json(
        &mut no_noise,
        json!({"action": "subscribe", "data": {
            "levels": ["INFO", "ERROR"],
            "message_excludes": ["healthcheck"]
        }}),
    )
    .await;
    assert_eq!(next_frame(&mut no_noise).await["type"], "ack");
    settle().await;

    // Dropped by both: wrong level for one, excluded for the other.
    server.hub.try_broadcast(entry("INFO", "healthcheck ok"));
    // Received by both.
    server.hub.try_broadcast(entry("ERROR", "boom"));

    let frame = next_frame(&mut errors_only).await;
    assert_eq!(frame["type"], "log");
    assert_eq!(frame["data"]["message"], "boom");
    assert_eq!(frame["data"]["level"], "ERROR");

    let frame = next_frame(&mut no_noise).await;
    assert_eq!(frame["type"], "log");
    assert_eq!(frame["data"]["message"], "boom");
}

#[tokio::test]
async fn ping_pong_and_stats() {
    let server = spawn_server(4).await;

    let mut ws = connect(server.addr).await;
    send_json(&mut ws, json!({"action": "ping"})).await;
    let pong = next_frame(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["data"]["timestamp"].as_i64().unwrap() > 0);

    send_json(&mut ws, json!({"action": "stats"})).await;
    let stats = next_frame(&mut ws).await;
    assert_eq!(stats["type"], "stats");
    assert_eq!(stats["data"]["connected"], 1);
    assert_eq!(stats["data"]["total_clients"], 4);
    assert_eq!(stats["data"]["dropped"], 0);
}

#[tokio::test]
async fn bad_filter_keeps_previous_subscription() {
    let server = spawn_server(4).await;

    let mut ws = connect(server.addr).await;
    send_json(
        &mut ws,
        json!({"action": "subscribe", "data": {"levels": ["ERROR"]}}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "ack");

    // Broken regex: rejected, previous filter stays.
    send_json(
        &mut ws,
        json!({"action": "update", "data": {"message_regex": "(unclosed"}}),
    )
    .await;
    let error = next_frame(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "filter_error");
    settle().await;

    server.hub.try_broadcast(entry("INFO", "should not arrive"));
    server.hub.try_broadcast(entry("ERROR", "still filtered by old sub"));

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["data"]["message"], "still filtered by old sub");
}

#[tokio::test]
async fn unknown_action_is_reported() {
    let server = spawn_server(4).await;

    let mut ws = connect(server.addr).await;
    send_json(&mut ws, json!({"action": "selfdestruct"})).await;
    let error = next_frame(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "unknown_action");
}

#[tokio::test]
async fn over_cap_connection_is_closed() {
    let server = spawn_server(1).await;

    let mut first = connect(server.addr).await;
    send_json(&mut first, json!({"action": "ping"})).await;
    assert_eq!(next_frame(&mut first).await["type"], "pong");

    // Second connection is refused by the hub; its socket closes without
    // ever delivering frames.
    let mut second = connect(server.addr).await;
    settle().await;
    let outcome = timeout(Duration::from_secs(5), second.next()).await.unwrap();
    match outcome {
        None | Some(Ok(WsMsg::Close(_))) | Some(Err(_)) => {}
        other => panic!("expected closed connection, got {other:?}"),
    }

    assert_eq!(server.hub.client_count(), 1);
}

#[tokio::test]
async fn batched_subscription_receives_batch_frames() {
    let server = spawn_server(4).await;

    let mut ws = connect(server.addr).await;
    send_json(
        &mut ws,
        json!({"action": "subscribe", "data": {"levels": ["INFO"], "batch_timeout_ms": 50}}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "ack");
    settle().await;

    server.hub.try_broadcast(entry("INFO", "a"));
    server.hub.try_broadcast(entry("INFO", "b"));
    server.hub.try_broadcast(entry("INFO", "c"));

    let frame = next_frame(&mut ws).await;
    assert_eq!(frame["type"], "batch");
    assert_eq!(frame["data"]["count"], 3);
    assert_eq!(frame["data"]["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn stack_traces_are_reduced_for_subscribers() {
    let server = spawn_server(4).await;

    let mut ws = connect(server.addr).await;
    send_json(
        &mut ws,
        json!({"action": "subscribe", "data": {
            "levels": ["ERROR"],
            "stack_trace_mode": "filtered",
            "stack_trace_include": ["x.y.*"]
        }}),
    )
    .await;
    assert_eq!(next_frame(&mut ws).await["type"], "ack");
    settle().await;

    let mut e = entry("ERROR", "boom");
    e.stack_trace = "at a.b.C.m(C.java:1)\nat x.y.Z.n(Z.java:2)".into();
    server.hub.try_broadcast(e);

    let frame = next_frame(&mut ws).await;
    let trace = &frame["data"]["stack_trace"];
    assert_eq!(trace["omitted"], 0);
    assert_eq!(
        trace["frames"],
        json!(["at a.b.C.m(C.java:1)", "at x.y.Z.n(Z.java:2)"])
    );
    assert_eq!(trace["hash"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn http_query_and_metrics_endpoints() {
    let server = spawn_server(4).await;

    let client = reqwest::Client::new();
    let base = format!("http://{}", server.addr);

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let stats: Value = client
        .get(format!("{base}/api/query/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["total"], 0);
    assert_eq!(stats["degraded"], false);

    let response = client
        .get(format!("{base}/api/query/stats?logger_regex=(bad"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let hub_stats: Value = client
        .get(format!("{base}/api/hub/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(hub_stats["max_clients"], 4);

    let db_stats: Value = client
        .get(format!("{base}/api/db/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(db_stats["total_rows"], 0);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("# no log metrics available"));
}

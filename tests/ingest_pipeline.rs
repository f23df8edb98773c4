//! End-to-end ingest tests: TCP lines through the store and the hub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::timeout;

use logstat::hub::{Hub, HubConfig};
use logstat::ingest::{run_with_listener, LineHandler};
use logstat::store::db::DurableSink;
use logstat::store::query::QueryFilter;
use logstat::store::{StatStore, StoreOptions};

struct TestStack {
    addr: SocketAddr,
    store: Arc<StatStore>,
    hub: Hub,
    _shutdown_tx: broadcast::Sender<()>,
    _dir: tempfile::TempDir,
}

async fn spawn_stack(rewrite_timers: bool) -> TestStack {
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
            max_clients: 4,
            broadcast_capacity: 64,
            session_queue_capacity: 8,
        },
        shutdown_rx,
    );

    let handler = Arc::new(LineHandler::new(
        Arc::clone(&store),
        hub.clone(),
        rewrite_timers,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_with_listener(listener, handler, shutdown_tx.subscribe()));

    TestStack {
        addr,
        store,
        hub,
        _shutdown_tx: shutdown_tx,
        _dir: dir,
    }
}

async fn send_lines(addr: SocketAddr, lines: &[&str]) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    for line in lines {
        stream.write_all(line.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();
    }
    stream.flush().await.unwrap();
    stream.shutdown().await.unwrap();
}

async fn wait_for_live_rows(store: &StatStore, expected: usize) -> Vec<logstat::model::StatRow> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rows = store.snapshot().await;
        if rows.len() >= expected {
            return rows;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("expected {expected} live rows, found {}", rows.len());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn tcp_lines_become_live_counters() {
    let stack = spawn_stack(false).await;

    send_lines(
        stack.addr,
        &[
            r#"{"level":"INFO","loggerName":"app.A","hostName":"h1","message":"one"}"#,
            r#"{"level":"INFO","loggerName":"app.A","hostName":"h1","message":"two"}"#,
            r#"{"level":"ERROR","loggerName":"app.B","hostName":"h2","message":"boom"}"#,
        ],
    )
    .await;

    let rows = wait_for_live_rows(&stack.store, 2).await;
    assert_eq!(rows.len(), 2);

    let a = rows.iter().find(|r| r.logger == "app.A").unwrap();
    assert_eq!(a.n, 2);
    assert_eq!(a.hostname, "h1");
    let b = rows.iter().find(|r| r.logger == "app.B").unwrap();
    assert_eq!(b.n, 1);
    assert_eq!(b.level, "ERROR");
}

#[tokio::test]
async fn malformed_lines_are_skipped_not_fatal() {
    let stack = spawn_stack(false).await;

    send_lines(
        stack.addr,
        &[
            "this is not json",
            r#"{"level":"INFO","loggerName":"app.A"}"#,
            r#"{"level":"INFO","loggerName":"app.A","hostName":"h1"}"#,
        ],
    )
    .await;

    let rows = wait_for_live_rows(&stack.store, 1).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].n, 1);
}

#[tokio::test]
async fn records_fan_out_to_sessions() {
    let stack = spawn_stack(false).await;

    let (session, mut rx) = stack.hub.new_session();
    stack.hub.register(Arc::clone(&session)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    send_lines(
        stack.addr,
        &[r#"{"level":"ERROR","loggerName":"app.B","hostName":"h2","message":"boom"}"#],
    )
    .await;

    let frame = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(value["type"], "log");
    assert_eq!(value["data"]["message"], "boom");
    assert_eq!(value["data"]["host"], "h2");
}

#[tokio::test]
async fn stalled_subscriber_never_blocks_ingest() {
    let stack = spawn_stack(false).await;

    // A session nobody drains: its 8-slot queue fills and overflows.
    let (session, _rx) = stack.hub.new_session();
    stack.hub.register(Arc::clone(&session)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let line = r#"{"level":"INFO","loggerName":"app.A","hostName":"h1","message":"m"}"#;
    let lines: Vec<&str> = std::iter::repeat(line).take(50).collect();
    send_lines(stack.addr, &lines).await;

    // Every record still reaches the store.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rows = stack.store.snapshot().await;
        if rows.first().map(|r| r.n) == Some(50) {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("ingest stalled behind a slow subscriber");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // And the overflow was counted, not queued.
    assert!(session.dropped_queue() > 0);
}

#[tokio::test]
async fn timer_loggers_are_rewritten_when_enabled() {
    let stack = spawn_stack(true).await;

    send_lines(
        stack.addr,
        &[
            r#"{"level":"INFO","loggerName":"ejb.TimerService","hostName":"h1","message":"fired timedObjectId=orders.Cleanup now"}"#,
            r#"{"level":"INFO","loggerName":"ejb.TimerService","hostName":"h1","message":"no id"}"#,
        ],
    )
    .await;

    let rows = wait_for_live_rows(&stack.store, 2).await;
    let loggers: Vec<&str> = rows.iter().map(|r| r.logger.as_str()).collect();
    assert!(loggers.contains(&"ejb.TimerService:orders.Cleanup"));
    assert!(loggers.contains(&"ejb.TimerService:Unknown"));
}

#[tokio::test]
async fn flushed_counters_reach_the_query_layer() {
    let stack = spawn_stack(false).await;

    send_lines(
        stack.addr,
        &[
            r#"{"level":"INFO","loggerName":"app.A","hostName":"h1","message":"one"}"#,
            r#"{"level":"INFO","loggerName":"app.A","hostName":"h1","message":"two"}"#,
        ],
    )
    .await;
    wait_for_live_rows(&stack.store, 1).await;

    stack.store.flush().await.unwrap();
    assert!(stack.store.snapshot().await.is_empty());

    let outcome = stack
        .store
        .query_stats(&QueryFilter::both_sides())
        .await
        .unwrap();
    assert_eq!(outcome.rows.len(), 1);
    assert_eq!(outcome.rows[0].n, 2);
    assert!(outcome.rows[0].id > 0);
}

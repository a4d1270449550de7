//! Robustness tests: concurrent clients across worker loops, connect/
//! disconnect churn, message-size enforcement, and failure isolation
//! between connections.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use bazaar_core::MethodError;
use bazaard::dispatch::{MethodHandler, SessionContext};
use bazaard::engine::{Engine, EngineConfig};
use bazaard::listener::Listener;
use bazaard::pool::LoopPool;
use bazaard::registry::ConnectionRegistry;
use bazaard::store::{SessionStore, StoreActor};
use bazaard::transport::{BoundListener, ListenAddr};

const STEP_TIMEOUT: Duration = Duration::from_secs(10);

struct EchoHandler;

#[async_trait]
impl MethodHandler for EchoHandler {
    async fn call(
        &self,
        _ctx: &SessionContext,
        method: &str,
        params: Value,
    ) -> Result<Value, MethodError> {
        match method {
            "echo" => Ok(params),
            other => Err(MethodError::method_not_found(other)),
        }
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    listener: Arc<Listener>,
    cancel: CancellationToken,
    _pool: Arc<LoopPool>,
}

fn spawn_gateway(workers: usize, config: EngineConfig) -> Harness {
    let bound = BoundListener::bind(
        &ListenAddr::Tcp("127.0.0.1:0".parse().expect("addr")),
        false,
        None,
    )
    .expect("bind");
    let addr = bound.local_addr().expect("local addr");

    let pool = Arc::new(LoopPool::new(workers).expect("pool"));
    let (store_tx, store_rx) = mpsc::channel(256);
    pool.store_loop()
        .spawn(StoreActor::in_memory(store_rx).expect("store").run());
    let store = SessionStore::new(store_tx);

    let engine = Arc::new(Engine::new(
        Arc::new(ConnectionRegistry::new()),
        store,
        Arc::new(EchoHandler),
        config,
    ));

    let cancel = CancellationToken::new();
    let listener = Arc::new(Listener::new(
        bound,
        Arc::clone(&pool),
        Arc::new(AtomicU64::new(1)),
        cancel.clone(),
    ));
    listener.run_accept_loop(4, engine);

    Harness {
        addr,
        listener,
        cancel,
        _pool: pool,
    }
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn connect(addr: std::net::SocketAddr) -> Ws {
    let (ws, _) = timeout(
        STEP_TIMEOUT,
        tokio_tungstenite::connect_async(format!("ws://{addr}/api")),
    )
    .await
    .expect("connect timeout")
    .expect("connect");
    ws
}

async fn recover(ws: &mut Ws) {
    ws.send(Message::Text(
        json!({ "jsonrpc": "2.0", "method": "recover_session", "id": 0 }).to_string(),
    ))
    .await
    .expect("send recover");
    next_text(ws).await;
}

async fn next_text(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("reply timeout")
            .expect("stream ended")
            .expect("read");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("json");
        }
    }
}

#[tokio::test]
async fn test_many_concurrent_clients() {
    let harness = spawn_gateway(4, EngineConfig::default());

    let mut tasks = Vec::new();
    for n in 0..12u64 {
        let addr = harness.addr;
        tasks.push(tokio::spawn(async move {
            let mut ws = connect(addr).await;
            recover(&mut ws).await;

            for i in 0..5u64 {
                let id = n * 100 + i;
                ws.send(Message::Text(
                    json!({
                        "jsonrpc": "2.0", "method": "echo",
                        "params": { "n": id }, "id": id
                    })
                    .to_string(),
                ))
                .await
                .expect("send");
                let reply = next_text(&mut ws).await;
                assert_eq!(reply["id"], id);
                assert_eq!(reply["result"]["n"], id);
            }
        }));
    }

    for task in tasks {
        task.await.expect("client task");
    }

    harness.cancel.cancel();
    harness.listener.clean_shutdown().await;
}

#[tokio::test]
async fn test_connect_disconnect_churn() {
    let harness = spawn_gateway(2, EngineConfig::default());

    for _ in 0..20 {
        let ws = connect(harness.addr).await;
        // Drop without any protocol traffic at all
        drop(ws);
    }

    // The gateway still serves a well-behaved client afterwards
    let mut ws = connect(harness.addr).await;
    recover(&mut ws).await;
    ws.send(Message::Text(
        json!({ "jsonrpc": "2.0", "method": "echo", "params": {"ok": 1}, "id": 1 }).to_string(),
    ))
    .await
    .expect("send");
    let reply = next_text(&mut ws).await;
    assert_eq!(reply["result"]["ok"], 1);

    harness.cancel.cancel();
    harness.listener.clean_shutdown().await;
}

#[tokio::test]
async fn test_oversized_message_tears_down_silently() {
    let config = EngineConfig {
        max_message_bytes: 1024,
        ..EngineConfig::default()
    };
    let harness = spawn_gateway(1, config);

    let mut ws = connect(harness.addr).await;
    recover(&mut ws).await;

    let big = "x".repeat(4 * 1024);
    let frame = json!({ "jsonrpc": "2.0", "method": "echo", "params": { "big": big }, "id": 1 });
    ws.send(Message::Text(frame.to_string()))
        .await
        .expect("send oversized");

    // No reply; the stream just ends
    let outcome = timeout(STEP_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => panic!("unexpected reply: {text}"),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(outcome.is_ok(), "connection was not torn down");

    harness.cancel.cancel();
    harness.listener.clean_shutdown().await;
}

#[tokio::test]
async fn test_one_abusive_client_does_not_disturb_others() {
    let harness = spawn_gateway(2, EngineConfig::default());

    let mut good = connect(harness.addr).await;
    recover(&mut good).await;

    // The abusive neighbor gets disconnected...
    let mut bad = connect(harness.addr).await;
    recover(&mut bad).await;
    bad.send(Message::Text("not-json".into()))
        .await
        .expect("send garbage");
    let ended = timeout(STEP_TIMEOUT, async {
        loop {
            match bad.next().await {
                Some(Ok(Message::Text(_))) => panic!("abusive client got a reply"),
                Some(Ok(_)) => continue,
                Some(Err(_)) | None => break,
            }
        }
    })
    .await;
    assert!(ended.is_ok());

    // ...while the well-behaved one keeps working
    good.send(Message::Text(
        json!({ "jsonrpc": "2.0", "method": "echo", "params": {"still": "here"}, "id": 2 })
            .to_string(),
    ))
    .await
    .expect("send");
    let reply = next_text(&mut good).await;
    assert_eq!(reply["result"]["still"], "here");

    harness.cancel.cancel();
    harness.listener.clean_shutdown().await;
}

#[tokio::test]
async fn test_handler_errors_do_not_affect_sibling_requests() {
    let harness = spawn_gateway(1, EngineConfig::default());
    let mut ws = connect(harness.addr).await;
    recover(&mut ws).await;

    // One failing and one succeeding request in flight together
    ws.send(Message::Text(
        json!({ "jsonrpc": "2.0", "method": "does_not_exist", "id": "bad" }).to_string(),
    ))
    .await
    .expect("send");
    ws.send(Message::Text(
        json!({ "jsonrpc": "2.0", "method": "echo", "params": {"v": 7}, "id": "good" }).to_string(),
    ))
    .await
    .expect("send");

    let mut saw_error = false;
    let mut saw_result = false;
    for _ in 0..2 {
        let reply = next_text(&mut ws).await;
        match reply["id"].as_str() {
            Some("bad") => {
                assert_eq!(reply["error"]["code"], -32601);
                saw_error = true;
            }
            Some("good") => {
                assert_eq!(reply["result"]["v"], 7);
                saw_result = true;
            }
            other => panic!("unexpected id {other:?}"),
        }
    }
    assert!(saw_error && saw_result);

    harness.cancel.cancel();
    harness.listener.clean_shutdown().await;
}

#[tokio::test]
async fn test_shutdown_with_many_open_connections() {
    let harness = spawn_gateway(2, EngineConfig::default());

    let mut clients = Vec::new();
    for _ in 0..6 {
        let mut ws = connect(harness.addr).await;
        recover(&mut ws).await;
        clients.push(ws);
    }

    harness.cancel.cancel();
    timeout(STEP_TIMEOUT, harness.listener.clean_shutdown())
        .await
        .expect("drain timed out with open connections");
    assert_eq!(harness.listener.accepted_count().await, 0);
}

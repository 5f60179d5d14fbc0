//! End-to-end notice-engine tests: ban bookkeeping, persistence, and the
//! natural-lift scheduler, observed through a mock core service.

use futures::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use lobsterbridge::config::{Config, ConfigManager};
use lobsterbridge::core::CoreSession;
use lobsterbridge::gateway::GatewayLink;
use lobsterbridge::inbound::{ChatGate, NoticeEngine};
use lobsterbridge::response_pool::ResponsePool;
use lobsterbridge::store::{BanRecord, BanStore};

/// A mock core: accepts one WebSocket connection and forwards every text
/// frame it receives.
async fn start_mock_core() -> (u16, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        let Ok(stream) = tokio_tungstenite::accept_async(socket).await else {
            return;
        };
        let (_write, mut read) = stream.split();
        while let Some(Ok(Message::Text(text))) = read.next().await {
            if let Ok(value) = serde_json::from_str::<Value>(&text) {
                let _ = tx.send(value);
            }
        }
    });

    (port, rx)
}

struct Harness {
    engine: Arc<NoticeEngine>,
    store: Arc<BanStore>,
    core_frames: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
}

async fn start_harness() -> Harness {
    let (core_port, core_frames) = start_mock_core().await;

    let mut config = Config::default();
    config.core.host = "127.0.0.1".to_string();
    config.core.port = core_port;
    let manager = Arc::new(ConfigManager::from_config(config));

    let pool = Arc::new(ResponsePool::new());
    let link = Arc::new(GatewayLink::new(pool));
    let store = Arc::new(BanStore::open_in_memory().unwrap());

    let cancel = CancellationToken::new();
    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let (session, core) = CoreSession::new(&manager, inbound_tx);
    let session_cancel = cancel.clone();
    tokio::spawn(async move { session.run(session_cancel).await });

    let gate = Arc::new(ChatGate::new(manager.clone(), link.clone()));
    let engine = NoticeEngine::new(manager, link, core, gate, store.clone());
    engine.load_persisted();
    engine.spawn_tasks(&cancel);

    // Let the core connection come up.
    tokio::time::sleep(Duration::from_millis(300)).await;

    Harness {
        engine,
        store,
        core_frames,
        cancel,
    }
}

async fn next_notice(frames: &mut mpsc::UnboundedReceiver<Value>, wait: Duration) -> Value {
    timeout(wait, frames.recv())
        .await
        .expect("notice within deadline")
        .expect("core channel open")
}

#[tokio::test]
async fn ban_notice_persists_record_and_reaches_core() {
    let mut harness = start_harness().await;

    let raw = json!({
        "post_type": "notice",
        "notice_type": "group_ban",
        "sub_type": "ban",
        "group_id": 900,
        "user_id": 42,
        "operator_id": 7,
        "duration": 600,
    });
    harness.engine.handle_notice(&raw).await;

    // Persisted with a lift time in the future.
    let records = harness.store.read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].group_id, 900);
    assert_eq!(records[0].user_id, 42);
    assert!(records[0].lift_time > 0);

    // Delivered through the queue.
    let envelope = next_notice(&mut harness.core_frames, Duration::from_secs(5)).await;
    assert_eq!(envelope["message_info"]["message_id"], "notice");
    assert_eq!(envelope["message_segment"]["type"], "notify");
    assert_eq!(envelope["message_segment"]["data"]["sub_type"], "ban");
    assert_eq!(envelope["message_segment"]["data"]["duration"], 600);

    harness.cancel.cancel();
}

#[tokio::test]
async fn whole_group_ban_is_stored_as_user_zero() {
    let harness = start_harness().await;

    let raw = json!({
        "post_type": "notice",
        "notice_type": "group_ban",
        "sub_type": "ban",
        "group_id": 900,
        "user_id": 0,
        "operator_id": 7,
        "duration": -1,
    });
    harness.engine.handle_notice(&raw).await;

    let records = harness.store.read_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, BanRecord::WHOLE_GROUP);
    assert_eq!(records[0].lift_time, BanRecord::INDEFINITE);

    harness.cancel.cancel();
}

#[tokio::test]
async fn explicit_lift_removes_the_record() {
    let harness = start_harness().await;

    harness
        .engine
        .handle_notice(&json!({
            "post_type": "notice",
            "notice_type": "group_ban",
            "sub_type": "ban",
            "group_id": 900,
            "user_id": 42,
            "operator_id": 7,
            "duration": 600,
        }))
        .await;
    assert_eq!(harness.store.read_all().unwrap().len(), 1);

    harness
        .engine
        .handle_notice(&json!({
            "post_type": "notice",
            "notice_type": "group_ban",
            "sub_type": "lift_ban",
            "group_id": 900,
            "user_id": 42,
            "operator_id": 7,
        }))
        .await;
    assert!(harness.store.read_all().unwrap().is_empty());

    harness.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_ban_produces_a_synthesized_lift_notice() {
    let mut harness = start_harness().await;

    harness
        .engine
        .handle_notice(&json!({
            "post_type": "notice",
            "notice_type": "group_ban",
            "sub_type": "ban",
            "group_id": 900,
            "user_id": 42,
            "operator_id": 7,
            "duration": 1,
        }))
        .await;

    // First delivery is the ban notice itself.
    let ban = next_notice(&mut harness.core_frames, Duration::from_secs(5)).await;
    assert_eq!(ban["message_segment"]["data"]["sub_type"], "ban");

    // After the one-second ban expires, the scanner synthesizes a lift
    // notice with no operator.
    let lift = next_notice(&mut harness.core_frames, Duration::from_secs(15)).await;
    assert_eq!(lift["message_segment"]["data"]["sub_type"], "lift_ban");
    assert_eq!(
        lift["message_segment"]["data"]["lifted_user_info"]["user_id"],
        42
    );
    assert!(lift["message_info"].get("user_info").is_none());

    let raw: Value =
        serde_json::from_str(lift["raw_message"].as_str().unwrap()).unwrap();
    assert_eq!(raw["operator_id"], Value::Null);

    // The record is gone from the store.
    assert!(harness.store.read_all().unwrap().is_empty());

    harness.cancel.cancel();
}

#[tokio::test]
async fn bans_expired_while_down_are_lifted_on_startup() {
    // Seed a store with an already-expired ban, as if the adapter restarted.
    let (core_port, mut core_frames) = start_mock_core().await;
    let mut config = Config::default();
    config.core.host = "127.0.0.1".to_string();
    config.core.port = core_port;
    let manager = Arc::new(ConfigManager::from_config(config));

    let store = Arc::new(BanStore::open_in_memory().unwrap());
    store
        .upsert(&BanRecord {
            group_id: 900,
            user_id: 42,
            lift_time: 1,
        })
        .unwrap();

    let pool = Arc::new(ResponsePool::new());
    let link = Arc::new(GatewayLink::new(pool));
    let cancel = CancellationToken::new();
    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let (session, core) = CoreSession::new(&manager, inbound_tx);
    let session_cancel = cancel.clone();
    tokio::spawn(async move { session.run(session_cancel).await });

    let gate = Arc::new(ChatGate::new(manager.clone(), link.clone()));
    let engine = NoticeEngine::new(manager, link, core, gate, store.clone());
    engine.load_persisted();
    engine.spawn_tasks(&cancel);

    let lift = timeout(Duration::from_secs(10), core_frames.recv())
        .await
        .expect("lift notice within deadline")
        .unwrap();
    assert_eq!(lift["message_segment"]["data"]["sub_type"], "lift_ban");
    assert!(store.read_all().unwrap().is_empty());

    cancel.cancel();
}

//! End-to-end message translation: raw gateway frames in, canonical
//! envelopes out on the core socket, with a scripted gateway peer answering
//! the adapter's queries.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use lobsterbridge::config::{Config, ConfigManager, ListType};
use lobsterbridge::core::CoreSession;
use lobsterbridge::gateway::{GatewayLink, GatewayServer};
use lobsterbridge::inbound::{ChatGate, MessageTranslator};
use lobsterbridge::response_pool::ResponsePool;

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Mock core capturing every frame the adapter sends upstream.
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

/// Scripted gateway peer: connects to the adapter and answers queries.
fn spawn_gateway_responder(
    stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) {
    tokio::spawn(async move {
        let (mut write, mut read) = stream.split();
        while let Some(Ok(Message::Text(text))) = read.next().await {
            let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            let Some(echo) = frame.get("echo").cloned() else {
                continue;
            };
            let data = match frame.get("action").and_then(|a| a.as_str()) {
                Some("get_group_info") => json!({"group_id": 456, "group_name": "G"}),
                Some("get_group_member_info") => json!({
                    "user_id": frame["params"]["user_id"],
                    "nickname": "bob",
                    "card": "",
                }),
                Some("get_login_info") => json!({"user_id": 10_000, "nickname": "adapter"}),
                Some("get_record") => json!({"base64": "dm9pY2U="}),
                _ => json!({}),
            };
            let reply = json!({"status": "ok", "retcode": 0, "echo": echo, "data": data});
            if write
                .send(Message::Text(reply.to_string().into()))
                .await
                .is_err()
            {
                return;
            }
        }
    });
}

struct Harness {
    translator: Arc<MessageTranslator>,
    core_frames: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
}

async fn start_harness(mutate: impl FnOnce(&mut Config)) -> Harness {
    let (core_port, core_frames) = start_mock_core().await;
    let gateway_port = free_port().await;

    let mut config = Config::default();
    config.gateway.host = "127.0.0.1".to_string();
    config.gateway.port = gateway_port;
    config.core.host = "127.0.0.1".to_string();
    config.core.port = core_port;
    mutate(&mut config);
    let manager = Arc::new(ConfigManager::from_config(config));

    let pool = Arc::new(ResponsePool::new());
    let link = Arc::new(GatewayLink::new(pool.clone()));
    let cancel = CancellationToken::new();

    let sweeper_cancel = cancel.clone();
    tokio::spawn(pool.clone().run_sweeper(sweeper_cancel));

    let (frame_tx, _frame_rx) = mpsc::unbounded_channel();
    let server = GatewayServer::new(manager.clone(), link.clone(), frame_tx);
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.run(server_cancel).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (stream, _) = connect_async(format!("ws://127.0.0.1:{gateway_port}"))
        .await
        .unwrap();
    spawn_gateway_responder(stream);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (inbound_tx, _inbound_rx) = mpsc::channel(16);
    let (session, core) = CoreSession::new(&manager, inbound_tx);
    let session_cancel = cancel.clone();
    tokio::spawn(async move { session.run(session_cancel).await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let gate = Arc::new(ChatGate::new(manager.clone(), link.clone()));
    let translator = Arc::new(MessageTranslator::new(
        manager,
        link,
        core,
        gate,
        reqwest::Client::new(),
    ));

    Harness {
        translator,
        core_frames,
        cancel,
    }
}

fn group_text_frame(group_id: i64, text: &str) -> Value {
    json!({
        "post_type": "message",
        "message_type": "group",
        "sub_type": "normal",
        "message_id": 777,
        "group_id": group_id,
        "self_id": 10_000,
        "sender": {"user_id": 42, "nickname": "amy", "card": "A"},
        "raw_message": text,
        "message": [{"type": "text", "data": {"text": text}}],
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn group_message_translates_to_an_envelope() {
    let mut harness = start_harness(|_| {}).await;

    harness
        .translator
        .handle_raw_message(&group_text_frame(456, "hello"))
        .await;

    let envelope = timeout(Duration::from_secs(5), harness.core_frames.recv())
        .await
        .expect("envelope within deadline")
        .unwrap();
    assert_eq!(envelope["message_info"]["message_id"], 777);
    assert_eq!(envelope["message_info"]["group_info"]["group_id"], 456);
    assert_eq!(envelope["message_info"]["group_info"]["group_name"], "G");
    assert_eq!(envelope["message_info"]["user_info"]["user_id"], 42);
    assert_eq!(envelope["message_segment"]["type"], "seglist");
    assert_eq!(envelope["message_segment"]["data"][0]["data"], "hello");
    assert_eq!(envelope["raw_message"], "hello");

    harness.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn whitelist_rejects_unlisted_group() {
    let mut harness = start_harness(|config| {
        config.chat.group_list_type = ListType::Whitelist;
        config.chat.group_list = [123].into_iter().collect();
    })
    .await;

    harness
        .translator
        .handle_raw_message(&group_text_frame(456, "hello"))
        .await;

    // Nothing must reach the core.
    let nothing = timeout(Duration::from_millis(800), harness.core_frames.recv()).await;
    assert!(nothing.is_err(), "rejected message leaked to the core");

    harness.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn banned_sender_is_rejected() {
    let mut harness = start_harness(|config| {
        config.chat.ban_user_id = [42].into_iter().collect();
    })
    .await;

    harness
        .translator
        .handle_raw_message(&group_text_frame(456, "hello"))
        .await;

    let nothing = timeout(Duration::from_millis(800), harness.core_frames.recv()).await;
    assert!(nothing.is_err(), "banned sender leaked to the core");

    harness.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn voice_message_is_the_sole_segment() {
    let mut harness = start_harness(|_| {}).await;

    let frame = json!({
        "post_type": "message",
        "message_type": "group",
        "sub_type": "normal",
        "message_id": 778,
        "group_id": 456,
        "self_id": 10_000,
        "sender": {"user_id": 42, "nickname": "amy"},
        "message": [
            {"type": "text", "data": {"text": "before"}},
            {"type": "record", "data": {"file": "abc.amr"}},
            {"type": "text", "data": {"text": "after"}},
        ],
    });
    harness.translator.handle_raw_message(&frame).await;

    let envelope = timeout(Duration::from_secs(5), harness.core_frames.recv())
        .await
        .expect("envelope within deadline")
        .unwrap();
    let segs = envelope["message_segment"]["data"].as_array().unwrap();
    assert_eq!(segs.len(), 1, "voice must be the sole segment");
    assert_eq!(segs[0]["type"], "voice");
    assert_eq!(segs[0]["data"], "dm9pY2U=");

    harness.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn at_mention_resolves_member_nickname() {
    let mut harness = start_harness(|_| {}).await;

    let frame = json!({
        "post_type": "message",
        "message_type": "group",
        "sub_type": "normal",
        "message_id": 779,
        "group_id": 456,
        "self_id": 10_000,
        "sender": {"user_id": 42, "nickname": "amy"},
        "message": [{"type": "at", "data": {"qq": 55}}],
    });
    harness.translator.handle_raw_message(&frame).await;

    let envelope = timeout(Duration::from_secs(5), harness.core_frames.recv())
        .await
        .expect("envelope within deadline")
        .unwrap();
    let segs = envelope["message_segment"]["data"].as_array().unwrap();
    assert_eq!(segs[0]["data"], "@<bob:55>");

    harness.cancel.cancel();
}

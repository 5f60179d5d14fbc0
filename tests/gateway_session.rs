//! Integration tests for the gateway-side WebSocket server: auth, frame
//! routing, and echo correlation over a real socket.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;

use lobsterbridge::config::{Config, ConfigManager};
use lobsterbridge::gateway::{GatewayLink, GatewayServer};
use lobsterbridge::response_pool::ResponsePool;

/// Reserve an ephemeral port. Racy in principle, fine in practice.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestGateway {
    url: String,
    link: Arc<GatewayLink>,
    frames: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
}

/// Start a gateway server on an ephemeral port with the given token.
async fn start_gateway(token: &str) -> TestGateway {
    let port = free_port().await;
    let mut config = Config::default();
    config.gateway.host = "127.0.0.1".to_string();
    config.gateway.port = port;
    config.gateway.token = token.to_string();
    let manager = Arc::new(ConfigManager::from_config(config));

    let pool = Arc::new(ResponsePool::new());
    let link = Arc::new(GatewayLink::new(pool));
    let (frame_tx, frame_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let server = GatewayServer::new(manager, link.clone(), frame_tx);
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.run(server_cancel).await });

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestGateway {
        url: format!("ws://127.0.0.1:{port}"),
        link,
        frames: frame_rx,
        cancel,
    }
}

#[tokio::test]
async fn no_token_configured_accepts_anonymous_connections() {
    let gateway = start_gateway("").await;
    let (stream, _) = connect_async(gateway.url.as_str()).await.expect("connect");
    drop(stream);
    gateway.cancel.cancel();
}

#[tokio::test]
async fn missing_bearer_token_is_rejected_with_401() {
    let gateway = start_gateway("sekrit").await;
    let err = connect_async(gateway.url.as_str()).await.expect_err("must reject");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
    gateway.cancel.cancel();
}

#[tokio::test]
async fn valid_bearer_token_is_accepted() {
    let gateway = start_gateway("sekrit").await;
    let mut request = gateway.url.clone().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer sekrit".parse().unwrap());
    let (stream, _) = connect_async(request).await.expect("connect with token");
    drop(stream);
    gateway.cancel.cancel();
}

#[tokio::test]
async fn wrong_bearer_token_is_rejected() {
    let gateway = start_gateway("sekrit").await;
    let mut request = gateway.url.clone().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Authorization", "Bearer wrong".parse().unwrap());
    let err = connect_async(request).await.expect_err("must reject");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 401);
        }
        other => panic!("expected HTTP 401 rejection, got {other:?}"),
    }
    gateway.cancel.cancel();
}

#[tokio::test]
async fn event_frames_reach_the_frame_queue() {
    let mut gateway = start_gateway("").await;
    let (mut stream, _) = connect_async(gateway.url.as_str()).await.unwrap();

    let frame = json!({"post_type": "message", "message_type": "private", "message": []});
    stream
        .send(Message::Text(frame.to_string().into()))
        .await
        .unwrap();

    let routed = timeout(Duration::from_secs(2), gateway.frames.recv())
        .await
        .expect("frame routed")
        .unwrap();
    assert_eq!(routed["post_type"], "message");
    gateway.cancel.cancel();
}

#[tokio::test]
async fn echo_request_round_trips_through_the_pool() {
    let gateway = start_gateway("").await;
    let (mut stream, _) = connect_async(gateway.url.as_str()).await.unwrap();
    // Wait for the link to pick up the connection.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let link = gateway.link.clone();
    let request =
        tokio::spawn(async move {
            link.request("get_group_info", json!({"group_id": 5}), Duration::from_secs(2))
                .await
        });

    // The fake gateway answers the action by echoing the token back.
    let action = timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("action arrives")
        .unwrap()
        .unwrap();
    let action: Value = match action {
        Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text action, got {other:?}"),
    };
    assert_eq!(action["action"], "get_group_info");
    let echo = action["echo"].as_str().unwrap().to_string();

    let reply = json!({
        "status": "ok",
        "retcode": 0,
        "echo": echo,
        "data": {"group_name": "G"},
    });
    stream
        .send(Message::Text(reply.to_string().into()))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(2), request)
        .await
        .unwrap()
        .unwrap()
        .expect("response resolves");
    assert_eq!(response["data"]["group_name"], "G");
    gateway.cancel.cancel();
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let gateway = start_gateway("").await;
    let (_stream, _) = connect_async(gateway.url.as_str()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let start = std::time::Instant::now();
    let result = gateway
        .link
        .request("get_group_info", json!({"group_id": 5}), Duration::from_millis(100))
        .await;
    assert!(result.is_err());
    assert!(start.elapsed() >= Duration::from_millis(100));
    gateway.cancel.cancel();
}

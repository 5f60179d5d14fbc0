//! The OneBot-side WebSocket server.
//!
//! Accepts the single gateway connection, enforces Bearer-token auth before
//! the upgrade, and routes raw frames: events (`post_type` present) into the
//! frame queue, responses (`post_type` absent) into the response pool.

use crate::config::ConfigManager;
use crate::gateway::link::{GatewayError, GatewayLink};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Maximum inbound gateway frame (64 MiB).
pub const MAX_GATEWAY_FRAME: usize = 64 * 1024 * 1024;

/// Shared state for the gateway server.
#[derive(Clone)]
struct GatewayState {
    config: Arc<ConfigManager>,
    link: Arc<GatewayLink>,
    frames: mpsc::UnboundedSender<Value>,
    cancel: CancellationToken,
}

/// The gateway-facing WebSocket server. One instance per bind; the
/// supervisor constructs a fresh one after a `gateway` config change.
pub struct GatewayServer {
    config: Arc<ConfigManager>,
    link: Arc<GatewayLink>,
    frames: mpsc::UnboundedSender<Value>,
}

impl GatewayServer {
    pub fn new(
        config: Arc<ConfigManager>,
        link: Arc<GatewayLink>,
        frames: mpsc::UnboundedSender<Value>,
    ) -> Self {
        Self {
            config,
            link,
            frames,
        }
    }

    /// Bind and serve until `cancel` fires or the listener fails.
    ///
    /// A bind failure is returned to the caller: on first startup the
    /// supervisor treats it as fatal (port in use), on a restart it logs
    /// and retries with the next config change.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), GatewayError> {
        let snapshot = self.config.snapshot();
        let addr = format!("{}:{}", snapshot.gateway.host, snapshot.gateway.port);

        let listener =
            tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(|source| GatewayError::Bind {
                    addr: addr.clone(),
                    source,
                })?;

        info!("Gateway listening on ws://{addr}");

        let state = GatewayState {
            config: self.config.clone(),
            link: self.link.clone(),
            frames: self.frames.clone(),
            cancel: cancel.clone(),
        };
        // The gateway connects to whatever path it was configured with, so
        // every route upgrades.
        let app = Router::new().fallback(ws_handler).with_state(state);

        let shutdown = cancel.clone();
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.link.detach().await;
        if let Err(e) = result {
            error!("gateway server error: {e}");
        }
        info!("Gateway listener on {addr} closed");
        Ok(())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let token = state.config.snapshot().gateway.token.clone();
    if !token.trim().is_empty() {
        let authorized = headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .map(|v| v == format!("Bearer {token}"))
            .unwrap_or(false);
        if !authorized {
            warn!("gateway connection rejected: bad or missing bearer token");
            return (StatusCode::UNAUTHORIZED, "Unauthorized\n").into_response();
        }
    }

    ws.max_message_size(MAX_GATEWAY_FRAME)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: GatewayState) {
    info!("Gateway connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: outbound frames are serialized through one mpsc channel.
    let (tx, mut rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    state.link.attach(tx).await;

    loop {
        tokio::select! {
            _ = state.cancel.cancelled() => {
                debug!("gateway reader cancelled, closing connection");
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => route_frame(&state, &text),
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Gateway connection closed");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!("gateway read error: {e}");
                        break;
                    }
                }
            }
        }
    }

    state.link.detach().await;
    writer.abort();
}

/// Sort one raw frame: events into the frame queue, responses into the pool.
fn route_frame(state: &GatewayState, text: &str) {
    let mut preview_end = text.len().min(1500);
    while !text.is_char_boundary(preview_end) {
        preview_end -= 1;
    }
    debug!("gateway frame: {}", &text[..preview_end]);

    let frame: Value = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("unparseable gateway frame dropped: {e}");
            return;
        }
    };

    match frame.get("post_type") {
        Some(_) => {
            if state.frames.send(frame).is_err() {
                warn!("frame queue closed, dropping gateway event");
            }
        }
        None => state.link.pool().deliver(frame),
    }
}

//! Client connection to the upstream core service.
//!
//! Connects out over WebSocket in one of two modes (see [`route`]), keeps
//! reconnecting with capped exponential backoff, and exposes a cheap handle
//! for the rest of the adapter to push envelopes through. Inbound frames
//! from the core are decoded and forwarded to the send handler.

mod route;

pub use route::{ApiClientRoute, CoreRoute, LegacyRoute};

use crate::config::{ConfigManager, CoreMode};
use crate::message::MessageBase;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outbound envelopes above this size are dropped (the core's socket limit
/// is 100 MiB; 95 leaves headroom).
pub const MAX_OUTBOUND_BYTES: usize = 95 * 1024 * 1024;

/// Outbound envelopes above this size are sent with a warning.
pub const WARN_OUTBOUND_BYTES: usize = 1024 * 1024;

/// Reconnect backoff cap.
const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Sending half of the core connection. Clone-cheap via `Arc`.
pub struct CoreHandle {
    route: Arc<dyn CoreRoute>,
    tx: RwLock<Option<mpsc::Sender<String>>>,
}

impl CoreHandle {
    fn new(route: Arc<dyn CoreRoute>) -> Self {
        Self {
            route,
            tx: RwLock::new(None),
        }
    }

    async fn attach(&self, tx: mpsc::Sender<String>) {
        *self.tx.write().await = Some(tx);
    }

    async fn detach(&self) {
        *self.tx.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.tx.read().await.is_some()
    }

    /// Send an internal envelope to the core. Applies the outbound size
    /// guard; any failure is reported as `false`.
    pub async fn send_message(&self, message: &MessageBase) -> bool {
        let wire = match self.route.encode_message(message) {
            Ok(wire) => wire,
            Err(e) => {
                error!("failed to encode envelope for core: {e}");
                return false;
            }
        };

        let size = wire.len();
        match classify_outbound(size) {
            SizeVerdict::Drop => {
                error!(
                    "outbound envelope of {:.2} MiB exceeds the {} MiB limit, dropped ({})",
                    size as f64 / (1024.0 * 1024.0),
                    MAX_OUTBOUND_BYTES / (1024 * 1024),
                    message.origin(),
                );
                return false;
            }
            SizeVerdict::WarnAndSend => warn!(
                "outbound envelope is large ({:.2} MiB); delivery may lag",
                size as f64 / (1024.0 * 1024.0)
            ),
            SizeVerdict::Send => {}
        }

        self.send_wire(wire).await
    }

    /// Send a non-chat payload such as a `command_response` envelope.
    pub async fn send_custom_message(
        &self,
        platform: &str,
        message_type: &str,
        payload: Value,
    ) -> bool {
        let wire = match self.route.encode_custom(platform, message_type, payload) {
            Ok(wire) => wire,
            Err(e) => {
                error!("failed to encode custom message for core: {e}");
                return false;
            }
        };
        self.send_wire(wire).await
    }

    async fn send_wire(&self, wire: String) -> bool {
        let guard = self.tx.read().await;
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(wire).await.is_ok() {
                    true
                } else {
                    error!("core writer gone; check the connection to the core service");
                    false
                }
            }
            None => {
                error!("no core connection; check the connection to the core service");
                false
            }
        }
    }
}

/// Owns the reconnect loop for the core connection.
pub struct CoreSession {
    route: Arc<dyn CoreRoute>,
    handle: Arc<CoreHandle>,
    inbound: mpsc::Sender<MessageBase>,
}

impl CoreSession {
    /// Build a session for the mode selected in config. Returns the session
    /// and the shared sending handle.
    pub fn new(
        config: &Arc<ConfigManager>,
        inbound: mpsc::Sender<MessageBase>,
    ) -> (Self, Arc<CoreHandle>) {
        let snapshot = config.snapshot();
        let route: Arc<dyn CoreRoute> = match snapshot.core.effective_mode() {
            CoreMode::Legacy => {
                info!("Connecting to core in legacy router mode");
                Arc::new(LegacyRoute::new(&snapshot.core))
            }
            CoreMode::ApiClient => {
                info!("Connecting to core in api-client mode");
                Arc::new(ApiClientRoute::new(&snapshot.core))
            }
        };
        let handle = Arc::new(CoreHandle::new(route.clone()));
        (
            Self {
                route,
                handle: handle.clone(),
                inbound,
            },
            handle,
        )
    }

    /// Connect and serve until cancelled. Reconnects forever with capped
    /// exponential backoff plus jitter.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return;
            }

            match self.connect_once(&cancel, &mut attempt).await {
                Ok(()) => return,
                Err(e) => {
                    attempt = attempt.saturating_add(1);
                    let backoff = backoff_delay(attempt);
                    warn!(
                        "core connection failed ({e}); retrying in {:.1}s",
                        backoff.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
    }

    async fn connect_once(
        &self,
        cancel: &CancellationToken,
        attempt: &mut u32,
    ) -> anyhow::Result<()> {
        let url = self.route.url();
        let mut request = url.clone().into_client_request()?;
        for (name, value) in self.route.handshake_headers() {
            request.headers_mut().insert(name, value.parse()?);
        }

        let (stream, _) = connect_async(request).await?;
        info!("Connected to core at {url}");
        *attempt = 0;
        let (mut ws_tx, mut ws_rx) = stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(256);
        self.handle.attach(tx).await;

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx
                    .send(tungstenite::Message::Text(text.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = ws_rx.next() => {
                    match msg {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            if let Some(message) = self.route.decode_inbound(&text) {
                                if self.inbound.send(message).await.is_err() {
                                    debug!("send handler gone, stopping core reader");
                                    break;
                                }
                            }
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            info!("Core connection closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            error!("core read error: {e}");
                            break;
                        }
                    }
                }
            }
        }

        self.handle.detach().await;
        writer.abort();
        if cancel.is_cancelled() {
            Ok(())
        } else {
            anyhow::bail!("connection closed")
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = Duration::from_secs(1u64 << attempt.min(6));
    let capped = base.min(BACKOFF_CAP);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    capped + jitter
}

#[derive(Debug, PartialEq, Eq)]
enum SizeVerdict {
    Send,
    WarnAndSend,
    Drop,
}

fn classify_outbound(size: usize) -> SizeVerdict {
    if size > MAX_OUTBOUND_BYTES {
        SizeVerdict::Drop
    } else if size > WARN_OUTBOUND_BYTES {
        SizeVerdict::WarnAndSend
    } else {
        SizeVerdict::Send
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        assert!(backoff_delay(1) >= Duration::from_secs(2));
        assert!(backoff_delay(1) < Duration::from_secs(3));
        assert!(backoff_delay(10) >= BACKOFF_CAP);
        assert!(backoff_delay(10) < BACKOFF_CAP + Duration::from_millis(500));
    }

    #[test]
    fn size_guard_boundaries() {
        assert_eq!(classify_outbound(0), SizeVerdict::Send);
        assert_eq!(classify_outbound(WARN_OUTBOUND_BYTES), SizeVerdict::Send);
        assert_eq!(
            classify_outbound(WARN_OUTBOUND_BYTES + 1),
            SizeVerdict::WarnAndSend
        );
        assert_eq!(classify_outbound(MAX_OUTBOUND_BYTES), SizeVerdict::WarnAndSend);
        assert_eq!(classify_outbound(MAX_OUTBOUND_BYTES + 1), SizeVerdict::Drop);
    }
}

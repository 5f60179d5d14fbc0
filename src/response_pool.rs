//! Echo-token correlator for gateway query responses.
//!
//! Every action the adapter sends with an `echo` field registers a slot
//! here; the gateway session delivers response frames (frames without a
//! `post_type`) back into the matching slot. A background sweeper evicts
//! slots whose deadline passed so abandoned waiters do not leak.

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default deadline for callers that do not specify one.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Sweep cadence for expired slots.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("timed out waiting for gateway response")]
pub struct ResponseTimeout;

struct PendingSlot {
    tx: oneshot::Sender<Value>,
    deadline: Instant,
}

/// Pool of outstanding gateway queries keyed by echo token.
#[derive(Default)]
pub struct ResponsePool {
    pending: Mutex<HashMap<String, PendingSlot>>,
}

impl ResponsePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `echo` and wait for its response. Exactly one of
    /// `{response, ResponseTimeout}` is observed within the deadline.
    pub async fn await_response(
        &self,
        echo: &str,
        timeout: Duration,
    ) -> Result<Value, ResponseTimeout> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            // At most one live slot per token; a duplicate registration
            // drops the stale waiter.
            pending.insert(
                echo.to_string(),
                PendingSlot {
                    tx,
                    deadline: Instant::now() + timeout,
                },
            );
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Channel closed: the sweeper evicted us.
            Ok(Err(_)) => Err(ResponseTimeout),
            Err(_) => {
                self.pending.lock().remove(echo);
                Err(ResponseTimeout)
            }
        }
    }

    /// Post a response frame to its waiter. The frame must carry a string
    /// `echo`; unknown or missing tokens are dropped with a warning.
    pub fn deliver(&self, response: Value) {
        let Some(echo) = response.get("echo").and_then(|e| e.as_str()).map(String::from) else {
            warn!("gateway response without echo token, dropped");
            return;
        };
        let slot = self.pending.lock().remove(&echo);
        match slot {
            Some(slot) => {
                // First deliver wins; a racing duplicate finds no slot.
                if slot.tx.send(response).is_err() {
                    debug!(echo, "waiter gone before delivery");
                }
            }
            None => warn!(echo, "response for unknown echo token, dropped"),
        }
    }

    /// Number of outstanding slots.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    /// Evict every slot whose deadline has passed, waking its waiter with
    /// `ResponseTimeout` (the dropped sender closes the channel).
    fn sweep(&self) {
        let now = Instant::now();
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, slot| slot.deadline > now);
        let evicted = before - pending.len();
        if evicted > 0 {
            debug!(evicted, "evicted expired response slots");
        }
    }

    /// Run the eviction sweeper until cancelled.
    pub async fn run_sweeper(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => self.sweep(),
                _ = cancel.cancelled() => return,
            }
        }
    }
}

/// Fresh echo token, unique per gateway connection lifetime.
pub fn new_echo_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

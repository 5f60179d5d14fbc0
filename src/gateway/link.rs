//! Shared handle to the live gateway connection.
//!
//! The session registers its outbound writer here; translators, the notice
//! engine, and the command dispatcher all speak to the gateway through this
//! one handle. Queries attach an `echo` token and rendezvous with their
//! response through the [`ResponsePool`].

use crate::response_pool::{new_echo_token, ResponsePool, DEFAULT_RESPONSE_TIMEOUT};

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("failed to bind gateway listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no gateway connection")]
    NotConnected,
    #[error("gateway send failed")]
    Send,
    #[error("timed out waiting for gateway response")]
    Timeout,
    #[error("gateway returned status {status}: {body}")]
    Status { status: String, body: String },
}

/// Outbound half of the gateway connection plus the response correlator.
pub struct GatewayLink {
    tx: RwLock<Option<mpsc::Sender<String>>>,
    pool: Arc<ResponsePool>,
}

impl GatewayLink {
    pub fn new(pool: Arc<ResponsePool>) -> Self {
        Self {
            tx: RwLock::new(None),
            pool,
        }
    }

    pub fn pool(&self) -> &Arc<ResponsePool> {
        &self.pool
    }

    /// Install the writer for a freshly accepted connection, replacing any
    /// previous one.
    pub async fn attach(&self, tx: mpsc::Sender<String>) {
        *self.tx.write().await = Some(tx);
    }

    /// Drop the writer when the connection closes.
    pub async fn detach(&self) {
        *self.tx.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.tx.read().await.is_some()
    }

    /// Send one raw text frame. Returns `false` when no connection is live
    /// or the writer has gone away.
    pub async fn send_text(&self, text: String) -> bool {
        let guard = self.tx.read().await;
        match guard.as_ref() {
            Some(tx) => tx.send(text).await.is_ok(),
            None => {
                warn!("gateway send attempted without a live connection");
                false
            }
        }
    }

    /// Fire an action without expecting a response.
    pub async fn send_action(&self, action: &str, params: Value) -> bool {
        let payload = json!({"action": action, "params": params});
        self.send_text(payload.to_string()).await
    }

    /// Send an action with an `echo` token and wait for the full response
    /// frame. The response's `status` is not interpreted here.
    pub async fn request(
        &self,
        action: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, GatewayError> {
        let echo = new_echo_token();
        let payload = json!({"action": action, "params": params, "echo": echo});
        if !self.send_text(payload.to_string()).await {
            return Err(GatewayError::NotConnected);
        }
        self.pool
            .await_response(&echo, timeout)
            .await
            .map_err(|_| GatewayError::Timeout)
    }

    /// As [`request`], but demand `status == "ok"` and unwrap `data`.
    pub async fn query_data(
        &self,
        action: &str,
        params: Value,
    ) -> Result<Value, GatewayError> {
        let response = self
            .request(action, params, DEFAULT_RESPONSE_TIMEOUT)
            .await?;
        let status = response
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("")
            .to_string();
        if status != "ok" {
            return Err(GatewayError::Status {
                status,
                body: response.to_string(),
            });
        }
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    }

    // ------------------------------------------------------------------
    // Typed query facade. All best-effort: failures log and yield None.
    // ------------------------------------------------------------------

    pub async fn get_group_info(&self, group_id: i64) -> Option<Value> {
        self.query_optional("get_group_info", json!({"group_id": group_id}))
            .await
    }

    pub async fn get_member_info(&self, group_id: i64, user_id: i64) -> Option<Value> {
        self.query_optional(
            "get_group_member_info",
            json!({"group_id": group_id, "user_id": user_id, "no_cache": true}),
        )
        .await
    }

    pub async fn get_self_info(&self) -> Option<Value> {
        self.query_optional("get_login_info", json!({})).await
    }

    pub async fn get_stranger_info(&self, user_id: i64) -> Option<Value> {
        self.query_optional("get_stranger_info", json!({"user_id": user_id}))
            .await
    }

    pub async fn get_message_detail(&self, message_id: Value) -> Option<Value> {
        self.query_optional("get_msg", json!({"message_id": message_id}))
            .await
    }

    pub async fn get_record_detail(&self, file: &str) -> Option<Value> {
        self.query_optional("get_record", json!({"file": file, "out_format": "wav"}))
            .await
    }

    /// Fetch the manifest of a forward message; yields the `messages` array.
    pub async fn get_forward_messages(&self, forward_id: Value) -> Option<Value> {
        let data = self
            .query_optional("get_forward_msg", json!({"message_id": forward_id}))
            .await?;
        data.get("messages").cloned()
    }

    async fn query_optional(&self, action: &str, params: Value) -> Option<Value> {
        match self.query_data(action, params).await {
            Ok(data) => Some(data),
            Err(e) => {
                debug!(action, "gateway query failed: {e}");
                None
            }
        }
    }
}

//! Outbound side: messages and commands arriving from the core, headed for
//! the gateway.

mod command;
mod message;

pub use command::{build_action, is_known, CommandError};
pub use message::build_payload;

use crate::config::ConfigManager;
use crate::core::CoreHandle;
use crate::gateway::GatewayLink;
use crate::message::{now_ts, MessageBase, MessageId, Seg};
use crate::response_pool::DEFAULT_RESPONSE_TIMEOUT;

use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Consumes envelopes from the core and turns them into gateway traffic.
pub struct SendHandler {
    config: Arc<ConfigManager>,
    gateway: Arc<GatewayLink>,
    core: Arc<CoreHandle>,
}

impl SendHandler {
    pub fn new(
        config: Arc<ConfigManager>,
        gateway: Arc<GatewayLink>,
        core: Arc<CoreHandle>,
    ) -> Self {
        Self {
            config,
            gateway,
            core,
        }
    }

    /// Drain the core-inbound channel until it closes or `cancel` fires.
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<MessageBase>,
        cancel: CancellationToken,
    ) {
        loop {
            let message = tokio::select! {
                received = inbound.recv() => match received {
                    Some(message) => message,
                    None => return,
                },
                _ = cancel.cancelled() => return,
            };
            self.handle_message(message).await;
        }
    }

    /// One envelope from the core: either a command or a chat message.
    pub async fn handle_message(&self, message: MessageBase) {
        info!("message received from core");
        match &message.message_segment {
            Seg::Command(_) => self.send_command(message).await,
            _ => self.send_normal(message).await,
        }
    }

    async fn send_command(&self, message: MessageBase) {
        let platform = message.message_info.platform.clone();
        let group_info = message.message_info.group_info.as_ref();
        let Seg::Command(data) = &message.message_segment else {
            return;
        };
        let command_name = data
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        let args = data.get("args").cloned().unwrap_or_else(|| json!({}));

        let (action, params) = match build_action(&command_name, &args, group_info) {
            Ok(built) => built,
            Err(e) => {
                error!("command rejected: {e}");
                self.send_command_response(&platform, &command_name, false, None, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let response = match self
            .gateway
            .request(&action, params, DEFAULT_RESPONSE_TIMEOUT)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("command {command_name} failed to reach the gateway: {e}");
                self.send_command_response(&platform, &command_name, false, None, Some(e.to_string()))
                    .await;
                return;
            }
        };

        let data = response.get("data").cloned();
        if response.get("status").and_then(|s| s.as_str()) == Some("ok") {
            info!("command {command_name} succeeded");
            self.send_command_response(&platform, &command_name, true, data, None)
                .await;
        } else {
            warn!("command {command_name} failed, gateway returned: {response}");
            self.send_command_response(
                &platform,
                &command_name,
                false,
                data,
                Some(response.to_string()),
            )
            .await;
        }
    }

    /// Report a command's outcome back to the core.
    async fn send_command_response(
        &self,
        platform: &str,
        command_name: &str,
        success: bool,
        data: Option<Value>,
        error: Option<String>,
    ) {
        let mut payload = json!({
            "command_name": command_name,
            "success": success,
            "timestamp": now_ts(),
        });
        if let Some(data) = data {
            payload["data"] = data;
        }
        if let Some(error) = error {
            payload["error"] = json!(error);
        }
        if self
            .core
            .send_custom_message(platform, "command_response", payload)
            .await
        {
            debug!(command_name, success, "command response sent");
        } else {
            error!("failed to send command response for {command_name}");
        }
    }

    async fn send_normal(&self, message: MessageBase) {
        let use_tts = self.config.snapshot().voice.use_tts;
        let payload = build_payload(&message.message_segment, use_tts);
        if payload.is_empty() {
            error!("outgoing message produced no gateway segments, dropped");
            return;
        }

        let group_info = message.message_info.group_info.as_ref();
        let user_info = message.message_info.user_info.as_ref();
        let (action, id_name, target_id) = match (group_info, user_info) {
            (Some(group), Some(_)) => {
                debug!("sending group message");
                ("send_group_msg", "group_id", group.group_id)
            }
            (None, Some(user)) => {
                debug!("sending private message");
                ("send_private_msg", "user_id", user.user_id)
            }
            _ => {
                error!("outgoing message without a deliverable target");
                return;
            }
        };

        let response = match self
            .gateway
            .request(
                action,
                json!({id_name: target_id, "message": payload}),
                DEFAULT_RESPONSE_TIMEOUT,
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!("message send failed: {e}");
                return;
            }
        };

        if response.get("status").and_then(|s| s.as_str()) == Some("ok") {
            info!("message delivered to gateway");
            let gateway_message_id = response
                .pointer("/data/message_id")
                .cloned()
                .unwrap_or(Value::Null);
            self.message_sent_back(&message, gateway_message_id).await;
        } else {
            warn!("message send failed, gateway returned: {response}");
        }
    }

    /// Tell the core which gateway message id its message ended up with.
    async fn message_sent_back(&self, message: &MessageBase, gateway_message_id: Value) {
        let origin_id = match &message.message_info.message_id {
            MessageId::Num(n) => json!(n),
            MessageId::Text(t) => json!(t),
        };
        let payload = json!({
            "origin_message_id": origin_id,
            "message_id": gateway_message_id,
            "time": now_ts(),
        });
        if !self
            .core
            .send_custom_message(
                &message.message_info.platform,
                "message_sent_back",
                payload,
            )
            .await
        {
            debug!("message_sent_back notification failed");
        }
    }
}

//! Envelope codecs for the two core connection modes.
//!
//! The socket plumbing is shared; a [`CoreRoute`] decides how envelopes look
//! on the wire and how the connection authenticates.

use crate::config::CoreConfig;
use crate::message::{ApiMessageBase, MessageBase};

use serde_json::{json, Value};
use tracing::debug;

/// Mode-specific framing for the core connection.
pub trait CoreRoute: Send + Sync {
    /// WebSocket URL to dial.
    fn url(&self) -> String;

    /// Extra headers for the connection handshake.
    fn handshake_headers(&self) -> Vec<(&'static str, String)>;

    /// Encode an internal envelope for the wire.
    fn encode_message(&self, message: &MessageBase) -> Result<String, serde_json::Error>;

    /// Encode a custom (non-chat) message such as `command_response`.
    fn encode_custom(
        &self,
        platform: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<String, serde_json::Error>;

    /// Decode an inbound frame into the internal envelope, if it is one.
    fn decode_inbound(&self, text: &str) -> Option<MessageBase>;
}

/// Legacy router mode: internal envelopes travel verbatim.
pub struct LegacyRoute {
    url: String,
}

impl LegacyRoute {
    pub fn new(config: &CoreConfig) -> Self {
        Self { url: config.url() }
    }
}

impl CoreRoute for LegacyRoute {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn handshake_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn encode_message(&self, message: &MessageBase) -> Result<String, serde_json::Error> {
        serde_json::to_string(message)
    }

    fn encode_custom(
        &self,
        platform: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&json!({
            "platform": platform,
            "message_type": message_type,
            "message": payload,
        }))
    }

    fn decode_inbound(&self, text: &str) -> Option<MessageBase> {
        match serde_json::from_str::<MessageBase>(text) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("non-envelope frame from core ignored: {e}");
                None
            }
        }
    }
}

/// API-client mode: rich envelopes with sender/receiver records, api key on
/// every frame.
pub struct ApiClientRoute {
    url: String,
    api_key: String,
    platform: String,
}

impl ApiClientRoute {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            url: config.url(),
            api_key: config.api_key.clone(),
            platform: config.platform_name.clone(),
        }
    }
}

impl CoreRoute for ApiClientRoute {
    fn url(&self) -> String {
        self.url.clone()
    }

    fn handshake_headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("X-Platform", self.platform.clone()),
        ]
    }

    fn encode_message(&self, message: &MessageBase) -> Result<String, serde_json::Error> {
        let api = ApiMessageBase::to_api_receive(message, &self.api_key, &self.platform);
        serde_json::to_string(&api)
    }

    fn encode_custom(
        &self,
        platform: &str,
        message_type: &str,
        payload: Value,
    ) -> Result<String, serde_json::Error> {
        serde_json::to_string(&json!({
            "api_key": self.api_key,
            "platform": platform,
            "message_type": message_type,
            "message": payload,
        }))
    }

    fn decode_inbound(&self, text: &str) -> Option<MessageBase> {
        match serde_json::from_str::<ApiMessageBase>(text) {
            Ok(api) => Some(api.into_legacy_send()),
            Err(e) => {
                debug!("non-envelope frame from core ignored: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FormatInfo, GroupInfo, MessageId, MessageInfo, Seg, UserInfo};

    fn sample() -> MessageBase {
        MessageBase {
            message_info: MessageInfo {
                platform: "qq".into(),
                message_id: MessageId::Num(1),
                time: 2.0,
                user_info: Some(UserInfo {
                    platform: "qq".into(),
                    user_id: 3,
                    user_nickname: None,
                    user_cardname: None,
                }),
                group_info: Some(GroupInfo {
                    platform: "qq".into(),
                    group_id: 4,
                    group_name: None,
                }),
                template_info: None,
                format_info: Some(FormatInfo::message()),
                additional_config: None,
            },
            message_segment: Seg::text("x"),
            raw_message: None,
        }
    }

    #[test]
    fn legacy_round_trips_envelopes() {
        let route = LegacyRoute::new(&CoreConfig::default());
        let wire = route.encode_message(&sample()).unwrap();
        let back = route.decode_inbound(&wire).unwrap();
        assert_eq!(back, sample());
    }

    #[test]
    fn api_route_moves_origin_to_sender_info() {
        let config = CoreConfig {
            api_key: "key".into(),
            base_url: "ws://core/ws".into(),
            enable_api_server: true,
            ..CoreConfig::default()
        };
        let route = ApiClientRoute::new(&config);
        let wire = route.encode_message(&sample()).unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["api_key"], "key");
        assert_eq!(value["message_info"]["sender_info"]["user_info"]["user_id"], 3);
        assert!(value["message_info"].get("user_info").is_none());
    }

    #[test]
    fn api_route_decodes_receiver_info() {
        let config = CoreConfig {
            api_key: "key".into(),
            enable_api_server: true,
            ..CoreConfig::default()
        };
        let route = ApiClientRoute::new(&config);
        let wire = serde_json::json!({
            "message_info": {
                "platform": "qq",
                "message_id": 9,
                "time": 1.0,
                "receiver_info": {
                    "group_info": {"platform": "qq", "group_id": 77}
                }
            },
            "message_segment": {"type": "text", "data": "out"}
        })
        .to_string();
        let message = route.decode_inbound(&wire).unwrap();
        assert_eq!(message.message_info.group_info.unwrap().group_id, 77);
        assert!(message.message_info.user_info.is_none());
    }
}

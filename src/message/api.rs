//! API-client-mode envelope.
//!
//! The api_client core speaks a richer envelope than the legacy router:
//! conversation endpoints are explicit `sender_info`/`receiver_info` records
//! and every frame carries the api key and platform. Messages we receive
//! address *us* through `receiver_info`; messages we send carry the chat
//! origin in `sender_info`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{FormatInfo, GroupInfo, MessageBase, MessageId, MessageInfo, Seg, UserInfo};

/// One side of a conversation: the user and (for group chats) the group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConversationInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessageInfo {
    pub platform: String,
    pub message_id: MessageId,
    pub time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_info: Option<ConversationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_info: Option<ConversationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_info: Option<FormatInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_config: Option<Map<String, Value>>,
}

/// Envelope exchanged with an api_client-mode core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessageBase {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub message_info: ApiMessageInfo,
    pub message_segment: Seg,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
}

impl ApiMessageBase {
    /// Wrap a legacy envelope for the receive direction (adapter → core).
    /// The chat origin moves into `sender_info`; the api key and platform
    /// are stamped on.
    pub fn to_api_receive(message: &MessageBase, api_key: &str, platform: &str) -> Self {
        let info = &message.message_info;
        let sender_info = if info.user_info.is_some() || info.group_info.is_some() {
            Some(ConversationInfo {
                user_info: info.user_info.clone(),
                group_info: info.group_info.clone(),
            })
        } else {
            None
        };
        Self {
            api_key: Some(api_key.to_string()),
            message_info: ApiMessageInfo {
                platform: if info.platform.is_empty() {
                    platform.to_string()
                } else {
                    info.platform.clone()
                },
                message_id: info.message_id.clone(),
                time: info.time,
                sender_info,
                receiver_info: None,
                template_info: info.template_info.clone(),
                format_info: info.format_info.clone(),
                additional_config: info.additional_config.clone(),
            },
            message_segment: message.message_segment.clone(),
            raw_message: message.raw_message.clone(),
        }
    }

    /// Unwrap an envelope from the send direction (core → adapter) into the
    /// legacy shape: `receiver_info` describes the chat to deliver into, so
    /// it becomes `user_info`/`group_info`.
    pub fn into_legacy_send(self) -> MessageBase {
        let receiver = self.message_info.receiver_info.unwrap_or_default();
        MessageBase {
            message_info: MessageInfo {
                platform: self.message_info.platform,
                message_id: self.message_info.message_id,
                time: self.message_info.time,
                user_info: receiver.user_info,
                group_info: receiver.group_info,
                template_info: self.message_info.template_info,
                format_info: self.message_info.format_info,
                additional_config: self.message_info.additional_config,
            },
            message_segment: self.message_segment,
            raw_message: self.raw_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_base() -> MessageBase {
        MessageBase {
            message_info: MessageInfo {
                platform: "qq".into(),
                message_id: MessageId::Num(5),
                time: 10.0,
                user_info: Some(UserInfo {
                    platform: "qq".into(),
                    user_id: 42,
                    user_nickname: Some("kay".into()),
                    user_cardname: None,
                }),
                group_info: Some(GroupInfo {
                    platform: "qq".into(),
                    group_id: 900,
                    group_name: Some("lab".into()),
                }),
                template_info: None,
                format_info: None,
                additional_config: None,
            },
            message_segment: Seg::text("hi"),
            raw_message: None,
        }
    }

    #[test]
    fn receive_direction_moves_origin_into_sender_info() {
        let api = ApiMessageBase::to_api_receive(&sample_base(), "k-123", "qq");
        assert_eq!(api.api_key.as_deref(), Some("k-123"));
        let sender = api.message_info.sender_info.unwrap();
        assert_eq!(sender.user_info.unwrap().user_id, 42);
        assert_eq!(sender.group_info.unwrap().group_id, 900);
        assert!(api.message_info.receiver_info.is_none());
    }

    #[test]
    fn send_direction_moves_receiver_info_back() {
        let api = ApiMessageBase {
            api_key: None,
            message_info: ApiMessageInfo {
                platform: "qq".into(),
                message_id: MessageId::Num(5),
                time: 10.0,
                sender_info: None,
                receiver_info: Some(ConversationInfo {
                    user_info: Some(UserInfo {
                        platform: "qq".into(),
                        user_id: 42,
                        user_nickname: None,
                        user_cardname: None,
                    }),
                    group_info: Some(GroupInfo {
                        platform: "qq".into(),
                        group_id: 900,
                        group_name: None,
                    }),
                }),
                template_info: None,
                format_info: None,
                additional_config: None,
            },
            message_segment: Seg::text("reply"),
            raw_message: None,
        };
        let legacy = api.into_legacy_send();
        assert_eq!(legacy.message_info.user_info.unwrap().user_id, 42);
        assert_eq!(legacy.message_info.group_info.unwrap().group_id, 900);
    }
}

mod api;
mod seg;

pub use api::*;
pub use seg::*;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Formats the adapter can hand to the core, advertised on every envelope.
pub const ACCEPT_FORMAT: &[&str] = &[
    "text", "image", "emoji", "voice", "reply", "command", "voiceurl", "music", "videourl", "file",
];

/// Current wall-clock time as float seconds, the envelope `time` convention.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Message id: numeric ids originate from the gateway; the literal string
/// `"notice"` marks internally synthesized notices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Num(i64),
    Text(String),
}

impl MessageId {
    pub const NOTICE: &'static str = "notice";

    pub fn notice() -> Self {
        MessageId::Text(Self::NOTICE.to_string())
    }

    pub fn is_notice(&self) -> bool {
        matches!(self, MessageId::Text(s) if s == Self::NOTICE)
    }
}

impl From<i64> for MessageId {
    fn from(id: i64) -> Self {
        MessageId::Num(id)
    }
}

/// Sender identity, normalized across both fabrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    pub platform: String,
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_nickname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_cardname: Option<String>,
}

/// Group identity; `group_name` is best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub platform: String,
    pub group_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
}

/// Declares which segment kinds the message carries and which the adapter
/// accepts in return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatInfo {
    pub content_format: Vec<String>,
    pub accept_format: Vec<String>,
}

impl FormatInfo {
    pub fn message() -> Self {
        Self {
            content_format: vec![
                "text".into(),
                "image".into(),
                "emoji".into(),
                "voice".into(),
            ],
            accept_format: ACCEPT_FORMAT.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn notice() -> Self {
        Self {
            content_format: vec!["text".into(), "notify".into()],
            accept_format: ACCEPT_FORMAT.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Envelope metadata for one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub platform: String,
    pub message_id: MessageId,
    /// Float seconds since the epoch.
    pub time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_info: Option<UserInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_info: Option<FormatInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_config: Option<Map<String, Value>>,
}

/// The canonical message envelope exchanged with the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageBase {
    pub message_info: MessageInfo,
    pub message_segment: Seg,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
}

impl MessageBase {
    /// Short origin description used when logging drops.
    pub fn origin(&self) -> String {
        let group = self
            .message_info
            .group_info
            .as_ref()
            .map(|g| g.group_id.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let user = self
            .message_info
            .user_info
            .as_ref()
            .map(|u| u.user_id.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "platform={}, group_id={}, user_id={}",
            self.message_info.platform, group, user
        )
    }
}

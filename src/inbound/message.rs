//! Gateway message frames → canonical envelopes.
//!
//! Applies the admission gate, resolves sender/group identity through
//! gateway queries, walks the raw segment array through per-variant
//! handlers, and ships the finished envelope to the core.

use crate::config::ConfigManager;
use crate::core::CoreHandle;
use crate::gateway::GatewayLink;
use crate::inbound::cards::extract_card;
use crate::inbound::face_codes::face_name;
use crate::inbound::fetch::fetch_base64;
use crate::inbound::forward::handle_forward;
use crate::inbound::gate::ChatGate;
use crate::message::{
    now_ts, FormatInfo, GroupInfo, MessageBase, MessageId, MessageInfo, Seg, UserInfo,
    VideoCardData,
};

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct MessageTranslator {
    config: Arc<ConfigManager>,
    gateway: Arc<GatewayLink>,
    core: Arc<CoreHandle>,
    gate: Arc<ChatGate>,
    http: reqwest::Client,
}

impl MessageTranslator {
    pub fn new(
        config: Arc<ConfigManager>,
        gateway: Arc<GatewayLink>,
        core: Arc<CoreHandle>,
        gate: Arc<ChatGate>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            config,
            gateway,
            core,
            gate,
            http,
        }
    }

    fn platform(&self) -> String {
        self.config.snapshot().core.platform_name.clone()
    }

    /// Entry point for one raw `post_type == "message"` frame.
    pub async fn handle_raw_message(&self, raw: &Value) {
        let message_id = raw.get("message_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let platform = self.platform();

        let (user_info, group_info) = match self.resolve_endpoints(raw, &platform).await {
            Some(endpoints) => endpoints,
            None => return,
        };

        if raw
            .get("message")
            .and_then(|m| m.as_array())
            .map(|m| m.is_empty())
            .unwrap_or(true)
        {
            warn!("raw message carries no content");
            return;
        }

        let (segments, mut additional_config) = self.translate_segments(raw, false).await;
        if self.config.snapshot().voice.use_tts {
            additional_config.insert("allow_tts".to_string(), Value::Bool(true));
        }
        if segments.is_empty() {
            warn!("message empty after translation, dropped");
            return;
        }

        let message = MessageBase {
            message_info: MessageInfo {
                platform: platform.clone(),
                message_id: MessageId::Num(message_id),
                time: now_ts(),
                user_info: Some(user_info),
                group_info,
                template_info: None,
                format_info: Some(FormatInfo::message()),
                additional_config: Some(additional_config),
            },
            message_segment: Seg::seglist(segments),
            raw_message: raw
                .get("raw_message")
                .and_then(|r| r.as_str())
                .map(String::from),
        };

        info!("forwarding message to core");
        self.core.send_message(&message).await;
    }

    /// Resolve sender and (for group messages) group identity, applying the
    /// admission gate. `None` means the message is rejected.
    async fn resolve_endpoints(
        &self,
        raw: &Value,
        platform: &str,
    ) -> Option<(UserInfo, Option<GroupInfo>)> {
        let message_type = raw.get("message_type").and_then(|v| v.as_str());
        let sub_type = raw.get("sub_type").and_then(|v| v.as_str());
        let sender = raw.get("sender").cloned().unwrap_or(Value::Null);
        let sender_id = sender.get("user_id").and_then(|v| v.as_i64())?;

        match message_type {
            Some("private") => match sub_type {
                Some("friend") => {
                    if !self.gate.allow_to_chat(sender_id, None, false, false).await {
                        return None;
                    }
                    Some((self.user_from_sender(&sender, platform, sender_id), None))
                }
                Some("group") => {
                    warn!("group-temporary private messages are not supported");
                    None
                }
                other => {
                    warn!(?other, "unsupported private message sub_type");
                    None
                }
            },
            Some("group") => {
                if sub_type != Some("normal") {
                    warn!(?sub_type, "unsupported group message sub_type");
                    return None;
                }
                let group_id = raw.get("group_id").and_then(|v| v.as_i64())?;
                if !self
                    .gate
                    .allow_to_chat(sender_id, Some(group_id), false, false)
                    .await
                {
                    return None;
                }
                // group_name is absent from message frames; resolve it
                // best-effort through a gateway query.
                let group_name = self
                    .gateway
                    .get_group_info(group_id)
                    .await
                    .and_then(|g| g.get("group_name").and_then(|n| n.as_str()).map(String::from));
                Some((
                    self.user_from_sender(&sender, platform, sender_id),
                    Some(GroupInfo {
                        platform: platform.to_string(),
                        group_id,
                        group_name,
                    }),
                ))
            }
            other => {
                warn!(?other, "unsupported message_type");
                None
            }
        }
    }

    fn user_from_sender(&self, sender: &Value, platform: &str, user_id: i64) -> UserInfo {
        UserInfo {
            platform: platform.to_string(),
            user_id,
            user_nickname: sender
                .get("nickname")
                .and_then(|n| n.as_str())
                .map(String::from),
            user_cardname: sender.get("card").and_then(|c| c.as_str()).map(String::from),
        }
    }

    /// Walk the raw segment array. Returns the translated segments plus the
    /// additional-config entries the walk produced (reply references).
    ///
    /// Boxed: reply handling re-enters this walk for the quoted message.
    pub fn translate_segments<'a>(
        &'a self,
        raw: &'a Value,
        in_reply: bool,
    ) -> BoxFuture<'a, (Vec<Seg>, Map<String, Value>)> {
        Box::pin(async move {
            let mut additional_config = Map::new();
            let Some(elements) = raw.get("message").and_then(|m| m.as_array()) else {
                warn!("message content absent");
                return (Vec::new(), additional_config);
            };

            let mut segments: Vec<Seg> = Vec::new();
            for element in elements {
                let data = element.get("data").cloned().unwrap_or(Value::Null);
                match element.get("type").and_then(|t| t.as_str()) {
                    Some("text") => match data.get("text").and_then(|t| t.as_str()) {
                        Some(text) => segments.push(Seg::text(text)),
                        None => warn!("text segment without text"),
                    },
                    Some("face") => match self.handle_face(&data) {
                        Some(seg) => segments.push(seg),
                        None => warn!("face segment unsupported or failed"),
                    },
                    Some("reply") if !in_reply => {
                        match self.handle_reply(&data).await {
                            Some((mut segs, reply_id)) => {
                                additional_config
                                    .insert("reply_message_id".to_string(), reply_id);
                                segments.append(&mut segs);
                            }
                            None => warn!("reply segment failed"),
                        }
                    }
                    Some("reply") => {}
                    Some("image") => match self.handle_image(&data).await {
                        Some(seg) => segments.push(seg),
                        None => warn!("image segment failed"),
                    },
                    Some("record") => match self.handle_record(&data).await {
                        Some(seg) => {
                            // Voice-only policy: a voice message is the sole
                            // content of its envelope.
                            segments.clear();
                            segments.push(seg);
                            break;
                        }
                        None => warn!("record segment unsupported or failed"),
                    },
                    Some("video") => match self.handle_video(&data) {
                        Some(seg) => segments.push(seg),
                        None => warn!("video segment failed"),
                    },
                    Some("json") => {
                        let mut segs = self.handle_card(&data).await;
                        if segs.is_empty() {
                            warn!("card segment failed");
                        } else {
                            segments.append(&mut segs);
                        }
                    }
                    Some("file") => match self.handle_file(&data) {
                        Some(seg) => segments.push(seg),
                        None => warn!("file segment failed"),
                    },
                    Some("at") => {
                        let self_id = raw.get("self_id").and_then(|v| v.as_i64());
                        let group_id = raw.get("group_id").and_then(|v| v.as_i64());
                        match self.handle_at(&data, self_id, group_id).await {
                            Some(seg) => segments.push(seg),
                            None => warn!("at segment failed"),
                        }
                    }
                    Some("forward") => {
                        let Some(messages) = self.fetch_forward(&data).await else {
                            warn!("forward content empty or fetch failed");
                            return (Vec::new(), additional_config);
                        };
                        let threshold = self.config.snapshot().forward.image_threshold;
                        match handle_forward(&self.http, threshold, &messages).await {
                            Some(seg) => segments.push(seg),
                            None => warn!("forward translation failed"),
                        }
                    }
                    Some("rps") => warn!("rock-paper-scissors segments are not supported"),
                    Some("dice") => warn!("dice segments are not supported"),
                    Some("shake") => warn!("window-shake segments are not supported"),
                    Some("share") => warn!("link-share segments are not supported"),
                    Some("node") => warn!("bare forward-node segments are not supported"),
                    other => warn!(?other, "unknown segment type"),
                }
            }
            (segments, additional_config)
        })
    }

    fn handle_face(&self, data: &Value) -> Option<Seg> {
        let id = match data.get("id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => return None,
        };
        match face_name(&id) {
            Some(name) => Some(Seg::text(name)),
            None => {
                warn!(id, "unsupported face id");
                None
            }
        }
    }

    async fn handle_image(&self, data: &Value) -> Option<Seg> {
        let url = data.get("url").and_then(|u| u.as_str())?;
        let encoded = match fetch_base64(&self.http, url).await {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("image fetch failed: {e}");
                return None;
            }
        };
        match data.get("sub_type").and_then(|s| s.as_i64()) {
            Some(0) => Some(Seg::Image(encoded)),
            Some(4) | Some(9) => {
                warn!("image sub_type dropped by policy");
                None
            }
            _ => Some(Seg::Emoji(encoded)),
        }
    }

    async fn handle_record(&self, data: &Value) -> Option<Seg> {
        let file = data.get("file").and_then(|f| f.as_str())?;
        let detail = self.gateway.get_record_detail(file).await?;
        let encoded = detail.get("base64").and_then(|b| b.as_str())?;
        if encoded.is_empty() {
            error!("record detail carried no audio data");
            return None;
        }
        Some(Seg::Voice(encoded.to_string()))
    }

    fn handle_video(&self, data: &Value) -> Option<Seg> {
        let file = data.get("file").and_then(|f| f.as_str()).unwrap_or_default();
        if file.is_empty() {
            warn!("video segment without file");
            return None;
        }
        Some(Seg::VideoCard(VideoCardData {
            file: file.to_string(),
            file_size: data
                .get("file_size")
                .map(value_to_string)
                .unwrap_or_default(),
            url: data
                .get("url")
                .and_then(|u| u.as_str())
                .unwrap_or_default()
                .to_string(),
        }))
    }

    async fn handle_card(&self, data: &Value) -> Vec<Seg> {
        let Some(card_json) = data.get("data").and_then(|d| d.as_str()) else {
            warn!("card segment without payload");
            return Vec::new();
        };
        extract_card(&self.http, card_json).await
    }

    fn handle_file(&self, data: &Value) -> Option<Seg> {
        let name = data.get("file").and_then(|f| f.as_str())?;
        let size = data
            .get("file_size")
            .map(value_to_string)
            .unwrap_or_else(|| "未知大小".to_string());
        let mut text = format!("[文件: {name}, 大小: {size}字节]");
        if let Some(url) = data.get("url").and_then(|u| u.as_str()) {
            text.push_str(&format!("\n文件链接: {url}"));
        }
        Some(Seg::text(text))
    }

    async fn handle_at(
        &self,
        data: &Value,
        self_id: Option<i64>,
        group_id: Option<i64>,
    ) -> Option<Seg> {
        let target = data.get("qq")?;
        let target_str = value_to_string(target);
        let is_self = self_id
            .map(|id| id.to_string() == target_str)
            .unwrap_or(false);

        if is_self {
            let info = self.gateway.get_self_info().await?;
            let nickname = info.get("nickname").and_then(|n| n.as_str())?;
            let user_id = info.get("user_id").and_then(|u| u.as_i64())?;
            Some(Seg::text(format!("@<{nickname}:{user_id}>")))
        } else {
            let target_id: i64 = target_str.parse().ok()?;
            let info = self
                .gateway
                .get_member_info(group_id?, target_id)
                .await?;
            let nickname = info.get("nickname").and_then(|n| n.as_str())?;
            let user_id = info.get("user_id").and_then(|u| u.as_i64())?;
            Some(Seg::text(format!("@<{nickname}:{user_id}>")))
        }
    }

    /// Quoted message: fetch, re-translate with the recursion guard, wrap
    /// with attribution text. Returns the wrapped segments and the quoted
    /// message id for `additional_config`.
    async fn handle_reply(&self, data: &Value) -> Option<(Vec<Seg>, Value)> {
        let reply_id = data.get("id")?.clone();
        let detail = self.gateway.get_message_detail(reply_id.clone()).await?;

        let (inner, _) = self.translate_segments(&detail, true).await;
        let inner = if inner.is_empty() {
            vec![Seg::text("(获取发言内容失败)")]
        } else {
            inner
        };

        let sender = detail.get("sender").cloned().unwrap_or(Value::Null);
        let mut segments = Vec::with_capacity(inner.len() + 2);
        match sender.get("nickname").and_then(|n| n.as_str()) {
            Some(nickname) => {
                let sender_id = sender.get("user_id").and_then(|u| u.as_i64()).unwrap_or(0);
                segments.push(Seg::text(format!("[回复<{nickname}:{sender_id}>：")));
            }
            None => {
                warn!("quoted sender nickname unavailable");
                segments.push(Seg::text("[回复 未知用户："));
            }
        }
        segments.extend(inner);
        segments.push(Seg::text("]，说："));
        Some((segments, reply_id))
    }

    async fn fetch_forward(&self, data: &Value) -> Option<Vec<Value>> {
        let forward_id = data.get("id")?.clone();
        let messages = self.gateway.get_forward_messages(forward_id).await?;
        messages.as_array().cloned()
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

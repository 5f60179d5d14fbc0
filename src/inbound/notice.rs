//! Notice handling: recalls, pokes, membership changes, and the ban
//! lifecycle with its natural-lift scheduler and at-least-once delivery
//! queues.

use crate::config::ConfigManager;
use crate::core::CoreHandle;
use crate::gateway::GatewayLink;
use crate::inbound::emoji_likes::reaction_name;
use crate::inbound::gate::ChatGate;
use crate::message::{
    now_ts, FormatInfo, GroupInfo, MessageBase, MessageId, MessageInfo, Seg, UserInfo,
};
use crate::store::{BanRecord, BanStore};

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Primary delivery queue depth.
const NOTICE_QUEUE_CAPACITY: usize = 100;

/// Retry queue depth; persistent failures cycle here.
const RETRY_QUEUE_CAPACITY: usize = 3;

/// Natural-lift scan cadence.
const LIFT_SCAN_INTERVAL: Duration = Duration::from_secs(5);

/// Pause between delivery iterations.
const DELIVERY_PACING: Duration = Duration::from_secs(1);

const FALLBACK_NICKNAME: &str = "QQ用户";

pub struct NoticeEngine {
    config: Arc<ConfigManager>,
    gateway: Arc<GatewayLink>,
    core: Arc<CoreHandle>,
    gate: Arc<ChatGate>,
    store: Arc<BanStore>,
    banned: Mutex<Vec<BanRecord>>,
    lifted: Mutex<Vec<BanRecord>>,
    notice_tx: mpsc::Sender<MessageBase>,
    retry_tx: mpsc::Sender<MessageBase>,
    notice_rx: tokio::sync::Mutex<mpsc::Receiver<MessageBase>>,
    retry_rx: tokio::sync::Mutex<mpsc::Receiver<MessageBase>>,
}

impl NoticeEngine {
    pub fn new(
        config: Arc<ConfigManager>,
        gateway: Arc<GatewayLink>,
        core: Arc<CoreHandle>,
        gate: Arc<ChatGate>,
        store: Arc<BanStore>,
    ) -> Arc<Self> {
        let (notice_tx, notice_rx) = mpsc::channel(NOTICE_QUEUE_CAPACITY);
        let (retry_tx, retry_rx) = mpsc::channel(RETRY_QUEUE_CAPACITY);
        Arc::new(Self {
            config,
            gateway,
            core,
            gate,
            store,
            banned: Mutex::new(Vec::new()),
            lifted: Mutex::new(Vec::new()),
            notice_tx,
            retry_tx,
            notice_rx: tokio::sync::Mutex::new(notice_rx),
            retry_rx: tokio::sync::Mutex::new(retry_rx),
        })
    }

    fn platform(&self) -> String {
        self.config.snapshot().core.platform_name.clone()
    }

    /// Load persisted bans, partitioning out the ones whose timer elapsed
    /// while the adapter was down; those go straight to the lifted list so
    /// the core still hears about them.
    pub fn load_persisted(&self) {
        match self.store.read_partitioned(now_ts() as i64) {
            Ok((active, expired)) => {
                info!(
                    active = active.len(),
                    expired = expired.len(),
                    "loaded persisted ban records"
                );
                *self.banned.lock() = active;
                *self.lifted.lock() = expired;
            }
            Err(e) => error!("failed to read persisted ban records: {e}"),
        }
    }

    /// Spawn the three background tasks: natural-lift detection, lift
    /// dispatch, and queue delivery.
    pub fn spawn_tasks(self: &Arc<Self>, cancel: &CancellationToken) {
        let engine = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { engine.run_lift_detect(token).await });

        let engine = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { engine.run_lift_dispatch(token).await });

        let engine = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move { engine.run_delivery(token).await });
    }

    // ------------------------------------------------------------------
    // Ban bookkeeping
    // ------------------------------------------------------------------

    fn ban_operation(&self, group_id: i64, user: Option<(i64, i64)>) {
        let record = match user {
            Some((user_id, lift_time)) => BanRecord {
                group_id,
                user_id,
                lift_time,
            },
            None => BanRecord::whole_group(group_id),
        };
        let mut banned = self.banned.lock();
        banned.retain(|r| !r.same_target(&record));
        banned.push(record);
        drop(banned);
        if let Err(e) = self.store.upsert(&record) {
            error!("failed to persist ban record: {e}");
        }
    }

    fn lift_operation(&self, group_id: i64, user_id: Option<i64>) {
        let record = BanRecord {
            group_id,
            user_id: user_id.unwrap_or(BanRecord::WHOLE_GROUP),
            lift_time: BanRecord::INDEFINITE,
        };
        self.banned.lock().retain(|r| !r.same_target(&record));
        self.lifted.lock().push(record);
        if let Err(e) = self.store.delete(&record) {
            error!("failed to delete ban record: {e}");
        }
    }

    /// Every tick, move user bans whose timer elapsed into the lifted list.
    async fn run_lift_detect(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(LIFT_SCAN_INTERVAL) => {}
                _ = cancel.cancelled() => return,
            }
            let now = now_ts() as i64;
            let mut expired = Vec::new();
            {
                let mut banned = self.banned.lock();
                banned.retain(|record| {
                    let done = record.user_id != BanRecord::WHOLE_GROUP
                        && record.lift_time != BanRecord::INDEFINITE
                        && record.lift_time <= now;
                    if done {
                        expired.push(*record);
                    }
                    !done
                });
            }
            for record in expired {
                info!(
                    user_id = record.user_id,
                    group_id = record.group_id,
                    "ban expired naturally"
                );
                self.lifted.lock().push(record);
            }
        }
    }

    /// Drain the lifted list, synthesizing `lift_ban` notices with no
    /// operator.
    async fn run_lift_dispatch(&self, cancel: CancellationToken) {
        loop {
            let record = self.lifted.lock().pop();
            let Some(record) = record else {
                tokio::select! {
                    _ = tokio::time::sleep(LIFT_SCAN_INTERVAL) => continue,
                    _ = cancel.cancelled() => return,
                }
            };

            if let Err(e) = self.store.delete(&record) {
                error!("failed to delete lifted ban record: {e}");
            }

            let Some(segment) = self.natural_lift_segment(&record).await else {
                continue;
            };
            let platform = self.platform();
            let group_info = self.resolve_group(record.group_id).await;

            let message = MessageBase {
                message_info: MessageInfo {
                    platform: platform.clone(),
                    message_id: MessageId::notice(),
                    time: now_ts(),
                    // A natural lift has no operator.
                    user_info: None,
                    group_info,
                    template_info: None,
                    format_info: None,
                    additional_config: None,
                },
                message_segment: segment,
                raw_message: Some(
                    json!({
                        "post_type": "notice",
                        "notice_type": "group_ban",
                        "sub_type": "lift_ban",
                        "group_id": record.group_id,
                        "user_id": record.user_id,
                        "operator_id": null,
                    })
                    .to_string(),
                ),
            };

            self.put_notice(message).await;

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn natural_lift_segment(&self, record: &BanRecord) -> Option<Seg> {
        if record.user_id == BanRecord::WHOLE_GROUP {
            return Some(Seg::Notify(json!({
                "sub_type": "whole_lift_ban",
                "lifted_user_info": null,
            })));
        }
        let lifted_user = self
            .member_user_info(record.group_id, record.user_id)
            .await;
        Some(Seg::Notify(json!({
            "sub_type": "lift_ban",
            "lifted_user_info": serde_json::to_value(&lifted_user).ok(),
        })))
    }

    // ------------------------------------------------------------------
    // Delivery queues
    // ------------------------------------------------------------------

    /// Enqueue for at-least-once delivery; full queues drop with a warning.
    pub async fn put_notice(&self, message: MessageBase) {
        if self.retry_tx.capacity() == 0 {
            warn!("notice queues saturated by repeated failures, dropping notice");
            return;
        }
        if let Err(e) = self.notice_tx.try_send(message) {
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("notice queue full, dropping notice")
                }
                mpsc::error::TrySendError::Closed(_) => {
                    warn!("notice queue closed, dropping notice")
                }
            }
        }
    }

    /// Deliver queued notices to the core; the retry queue drains first and
    /// failed sends cycle back into it.
    async fn run_delivery(&self, cancel: CancellationToken) {
        let mut notice_rx = self.notice_rx.lock().await;
        let mut retry_rx = self.retry_rx.lock().await;
        loop {
            let message = match retry_rx.try_recv() {
                Ok(message) => message,
                Err(_) => {
                    tokio::select! {
                        received = notice_rx.recv() => match received {
                            Some(message) => message,
                            None => return,
                        },
                        _ = cancel.cancelled() => return,
                    }
                }
            };

            if !self.core.send_message(&message).await {
                error!("notice delivery failed, moving to retry queue");
                if self.retry_tx.try_send(message).is_err() {
                    warn!("retry queue full, notice dropped");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(DELIVERY_PACING) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    // ------------------------------------------------------------------
    // Notice routing
    // ------------------------------------------------------------------

    /// Entry point for one raw `post_type == "notice"` frame.
    pub async fn handle_notice(&self, raw: &Value) {
        let notice_type = raw.get("notice_type").and_then(|v| v.as_str()).unwrap_or("");
        let group_id = raw.get("group_id").and_then(|v| v.as_i64());
        let user_id = raw.get("user_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let target_id = raw.get("target_id").cloned();

        let mut system_notice = false;
        let handled: Option<(Seg, UserInfo)> = match notice_type {
            "friend_recall" => {
                info!("friend recalled a message");
                self.handle_friend_recall(raw).await
            }
            "group_recall" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("group member recalled a message");
                system_notice = true;
                self.handle_group_recall(raw, group_id, user_id).await
            }
            "notify" => match raw.get("sub_type").and_then(|v| v.as_str()) {
                Some("poke") => {
                    if self.config.snapshot().chat.enable_poke
                        && self.gate.allow_to_chat(user_id, group_id, false, false).await
                    {
                        info!("handling poke");
                        self.handle_poke(raw, group_id, user_id).await
                    } else {
                        warn!("poke handling disabled, notice dropped");
                        None
                    }
                }
                Some("group_name") => {
                    if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                        return;
                    }
                    info!("handling group name change");
                    system_notice = true;
                    self.handle_group_name(raw, group_id, user_id).await
                }
                other => {
                    warn!(?other, "unsupported notify sub_type");
                    None
                }
            },
            "group_ban" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                system_notice = true;
                match raw.get("sub_type").and_then(|v| v.as_str()) {
                    Some("ban") => {
                        info!("handling group ban");
                        self.handle_ban(raw, group_id).await
                    }
                    Some("lift_ban") => {
                        info!("handling group ban lift");
                        self.handle_lift_ban(raw, group_id).await
                    }
                    other => {
                        warn!(?other, "unsupported group_ban sub_type");
                        None
                    }
                }
            }
            "group_msg_emoji_like" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling message reaction");
                self.handle_emoji_like(raw, group_id, user_id).await
            }
            "group_upload" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling group file upload");
                system_notice = true;
                self.handle_group_upload(raw, group_id, user_id).await
            }
            "group_increase" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling group member increase");
                system_notice = true;
                self.handle_group_increase(raw, group_id, user_id).await
            }
            "group_decrease" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling group member decrease");
                system_notice = true;
                self.handle_group_decrease(raw, group_id, user_id).await
            }
            "group_admin" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling group admin change");
                system_notice = true;
                self.handle_group_admin(raw, group_id, user_id).await
            }
            "essence" => {
                if !self.gate.allow_to_chat(user_id, group_id, true, false).await {
                    return;
                }
                info!("handling essence change");
                system_notice = true;
                self.handle_essence(raw, group_id).await
            }
            other => {
                warn!(?other, "unsupported notice type");
                return;
            }
        };

        let Some((segment, user_info)) = handled else {
            warn!("notice handling failed or unsupported");
            return;
        };

        let platform = self.platform();
        let group_info = match group_id {
            Some(group_id) => self.resolve_group(group_id).await,
            None => None,
        };

        let mut additional_config = Map::new();
        if let Some(target_id) = target_id {
            // Lets the core know who was on the receiving end of a poke.
            additional_config.insert("target_id".to_string(), target_id);
        }

        let message = MessageBase {
            message_info: MessageInfo {
                platform,
                message_id: MessageId::notice(),
                time: now_ts(),
                user_info: Some(user_info),
                group_info,
                template_info: None,
                format_info: Some(FormatInfo::notice()),
                additional_config: Some(additional_config),
            },
            message_segment: segment,
            raw_message: Some(raw.to_string()),
        };

        if system_notice {
            self.put_notice(message).await;
        } else {
            info!("forwarding notice to core");
            self.core.send_message(&message).await;
        }
    }

    // ------------------------------------------------------------------
    // Per-type handlers
    // ------------------------------------------------------------------

    async fn handle_friend_recall(&self, raw: &Value) -> Option<(Seg, UserInfo)> {
        let user_id = raw.get("user_id").and_then(|v| v.as_i64())?;
        let message_id = raw.get("message_id").cloned();

        let nickname = match self.gateway.get_stranger_info(user_id).await {
            Some(info) => info
                .get("nickname")
                .and_then(|n| n.as_str())
                .unwrap_or(FALLBACK_NICKNAME)
                .to_string(),
            None => {
                warn!("cannot resolve recalling friend's nickname");
                FALLBACK_NICKNAME.to_string()
            }
        };

        let user_info = UserInfo {
            platform: self.platform(),
            user_id,
            user_nickname: Some(nickname),
            user_cardname: None,
        };
        let segment = Seg::Notify(json!({
            "sub_type": "friend_recall",
            "message_id": message_id,
        }));
        Some((segment, user_info))
    }

    async fn handle_group_recall(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id.or_else(|| {
            error!("group recall without group id");
            None
        })?;
        let message_id = raw.get("message_id").cloned();
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64()).unwrap_or(0);

        let operator_info = self.member_user_info(group_id, operator_id).await;

        // Only attach the original sender when someone else recalled them.
        let recalled_user_info = if user_id != operator_id {
            let info = self.member_user_info(group_id, user_id).await;
            serde_json::to_value(&info).ok()
        } else {
            None
        };

        let segment = Seg::Notify(json!({
            "sub_type": "group_recall",
            "message_id": message_id,
            "recalled_user_info": recalled_user_info,
        }));
        Some((segment, operator_info))
    }

    async fn handle_poke(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let self_info = self.gateway.get_self_info().await.or_else(|| {
            error!("cannot resolve own identity");
            None
        })?;
        let self_id = raw.get("self_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let target_id = raw.get("target_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let raw_info = raw.get("raw_info").and_then(|v| v.as_array());

        let poker = match group_id {
            Some(group_id) => self.gateway.get_member_info(group_id, user_id).await,
            None => self.gateway.get_stranger_info(user_id).await,
        };
        let (user_name, user_cardname) = match &poker {
            Some(info) => (
                info.get("nickname")
                    .and_then(|n| n.as_str())
                    .unwrap_or(FALLBACK_NICKNAME)
                    .to_string(),
                info.get("card").and_then(|c| c.as_str()).map(String::from),
            ),
            None => {
                info!("cannot resolve poking user's nickname");
                (FALLBACK_NICKNAME.to_string(), None)
            }
        };

        let (display_name, target_name) = if self_id == target_id {
            let self_name = self_info
                .get("nickname")
                .and_then(|n| n.as_str())
                .unwrap_or(FALLBACK_NICKNAME)
                .to_string();
            (String::new(), self_name)
        } else if self_id == user_id {
            // Our own pokes are not reported back to the core.
            return None;
        } else {
            // Third-party pokes only exist in groups.
            let group_id = group_id?;
            let target_name = match self.gateway.get_member_info(group_id, target_id).await {
                Some(info) => info
                    .get("nickname")
                    .and_then(|n| n.as_str())
                    .unwrap_or(FALLBACK_NICKNAME)
                    .to_string(),
                None => {
                    info!("cannot resolve poked user's nickname");
                    FALLBACK_NICKNAME.to_string()
                }
            };
            (user_name.clone(), target_name)
        };

        // The gateway spells the poke action out in raw_info fragments.
        let mut first_txt = "戳了戳".to_string();
        let mut second_txt = String::new();
        if let Some(raw_info) = raw_info {
            if let Some(txt) = raw_info.get(2).and_then(|f| f.get("txt")).and_then(|t| t.as_str())
            {
                first_txt = txt.to_string();
            }
            if let Some(txt) = raw_info.get(4).and_then(|f| f.get("txt")).and_then(|t| t.as_str())
            {
                second_txt = txt.to_string();
            }
        } else {
            warn!("poke raw_info unavailable, using default phrasing");
        }

        let user_info = UserInfo {
            platform: self.platform(),
            user_id,
            user_nickname: Some(user_name),
            user_cardname,
        };
        let segment = Seg::text(format!(
            "{display_name}{first_txt}{target_name}{second_txt}（这是QQ的一个功能，用于提及某人，但没那么明显）"
        ));
        Some((segment, user_info))
    }

    async fn handle_group_name(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let new_name = raw.get("name_new").and_then(|v| v.as_str()).or_else(|| {
            warn!("group name change without the new name");
            None
        })?;

        let user_info = self.member_user_info(group_id, user_id).await;
        let segment = Seg::Notify(json!({
            "sub_type": "group_name",
            "action": format!("修改群名称为: {new_name}"),
            "new_name": new_name,
        }));
        Some((segment, user_info))
    }

    async fn handle_ban(&self, raw: &Value, group_id: Option<i64>) -> Option<(Seg, UserInfo)> {
        let group_id = group_id.or_else(|| {
            error!("ban notice without group id");
            None
        })?;
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let operator_info = self.member_user_info(group_id, operator_id).await;

        let duration = raw.get("duration").and_then(|v| v.as_i64()).or_else(|| {
            error!("ban notice without duration");
            None
        })?;
        let user_id = raw.get("user_id").and_then(|v| v.as_i64()).unwrap_or(0);

        let (sub_type, banned_user_info) = if user_id == 0 {
            self.ban_operation(group_id, None);
            ("whole_ban", None)
        } else {
            let banned_user = self.member_user_info(group_id, user_id).await;
            self.ban_operation(group_id, Some((user_id, now_ts() as i64 + duration)));
            ("ban", serde_json::to_value(&banned_user).ok())
        };

        let segment = Seg::Notify(json!({
            "sub_type": sub_type,
            "duration": duration,
            "banned_user_info": banned_user_info,
        }));
        Some((segment, operator_info))
    }

    async fn handle_lift_ban(
        &self,
        raw: &Value,
        group_id: Option<i64>,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id.or_else(|| {
            error!("ban lift notice without group id");
            None
        })?;
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let operator_info = self.member_user_info(group_id, operator_id).await;
        let user_id = raw.get("user_id").and_then(|v| v.as_i64()).unwrap_or(0);

        let (sub_type, lifted_user_info) = if user_id == 0 {
            self.lift_operation(group_id, None);
            ("whole_lift_ban", None)
        } else {
            let lifted_user = self.member_user_info(group_id, user_id).await;
            self.lift_operation(group_id, Some(user_id));
            ("lift_ban", serde_json::to_value(&lifted_user).ok())
        };

        let segment = Seg::Notify(json!({
            "sub_type": sub_type,
            "lifted_user_info": lifted_user_info,
        }));
        Some((segment, operator_info))
    }

    async fn handle_emoji_like(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id.or_else(|| {
            error!("reaction notice without group id");
            None
        })?;
        let user_info = self.member_user_info(group_id, user_id).await;
        let message_id = raw.get("message_id").cloned().unwrap_or(Value::Null);

        let mut emoji_texts = Vec::new();
        if let Some(likes) = raw.get("likes").and_then(|l| l.as_array()) {
            for like in likes {
                let emoji_id = match like.get("emoji_id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                };
                let count = like.get("count").and_then(|c| c.as_i64()).unwrap_or(1);
                let emoji = reaction_name(&emoji_id);
                if count > 1 {
                    emoji_texts.push(format!("{emoji}x{count}"));
                } else {
                    emoji_texts.push(emoji);
                }
            }
        }
        let emoji_str = if emoji_texts.is_empty() {
            "未知表情".to_string()
        } else {
            emoji_texts.join("、")
        };

        let display_name = user_info
            .user_cardname
            .clone()
            .filter(|c| !c.is_empty() && c != FALLBACK_NICKNAME)
            .or_else(|| user_info.user_nickname.clone())
            .unwrap_or_else(|| FALLBACK_NICKNAME.to_string());

        let message_id_text = match &message_id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let segment = Seg::text(format!(
            "{display_name} 对消息(ID:{message_id_text})表达了 {emoji_str}"
        ));
        Some((segment, user_info))
    }

    async fn handle_group_upload(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let file = raw.get("file").cloned().unwrap_or(Value::Null);
        let file_name = file
            .get("name")
            .and_then(|n| n.as_str())
            .unwrap_or("未知文件");
        let file_size = file.get("size").and_then(|s| s.as_i64()).unwrap_or(0);
        let file_id = file.get("id").and_then(|i| i.as_str()).unwrap_or("");

        let user_info = self.member_user_info(group_id, user_id).await;

        let size_str = if file_size < 1024 {
            format!("{file_size}B")
        } else if file_size < 1024 * 1024 {
            format!("{:.2}KB", file_size as f64 / 1024.0)
        } else {
            format!("{:.2}MB", file_size as f64 / (1024.0 * 1024.0))
        };

        let segment = Seg::Notify(json!({
            "sub_type": "group_upload",
            "file_name": file_name,
            "file_size": size_str,
            "file_id": file_id,
        }));
        Some((segment, user_info))
    }

    async fn handle_group_increase(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let sub_type = raw.get("sub_type").and_then(|v| v.as_str()).unwrap_or("");
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64());

        let user_info = self.member_user_info(group_id, user_id).await;
        let operator_name = match operator_id {
            Some(operator_id) if operator_id != 0 => {
                self.member_display_name(group_id, operator_id).await
            }
            _ => "未知".to_string(),
        };

        let action = match sub_type {
            "invite" => format!("被 {operator_name} 邀请"),
            "approve" => format!("经 {operator_name} 同意"),
            _ => "加入".to_string(),
        };

        let segment = Seg::Notify(json!({
            "sub_type": "group_increase",
            "action": action,
            "increase_type": sub_type,
            "operator_id": operator_id,
        }));
        Some((segment, user_info))
    }

    async fn handle_group_decrease(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let sub_type = raw.get("sub_type").and_then(|v| v.as_str()).unwrap_or("");
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64());

        let user_info = self.member_user_info(group_id, user_id).await;
        let operator_name = match operator_id {
            Some(operator_id) if operator_id != 0 => {
                self.member_display_name(group_id, operator_id).await
            }
            _ => "未知".to_string(),
        };

        let action = match sub_type {
            "leave" => "主动退群".to_string(),
            "kick" => format!("被 {operator_name} 踢出"),
            "kick_me" => "机器人被踢出".to_string(),
            _ => "离开群聊".to_string(),
        };

        let segment = Seg::Notify(json!({
            "sub_type": "group_decrease",
            "action": action,
            "decrease_type": sub_type,
            "operator_id": operator_id,
        }));
        Some((segment, user_info))
    }

    async fn handle_group_admin(
        &self,
        raw: &Value,
        group_id: Option<i64>,
        user_id: i64,
    ) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let sub_type = raw.get("sub_type").and_then(|v| v.as_str()).unwrap_or("");
        let user_info = self.member_user_info(group_id, user_id).await;

        let action = match sub_type {
            "set" => "被设置为管理员",
            "unset" => "被取消管理员",
            _ => "管理员变动",
        };

        let segment = Seg::Notify(json!({
            "sub_type": "group_admin",
            "action": action,
            "admin_type": sub_type,
        }));
        Some((segment, user_info))
    }

    async fn handle_essence(&self, raw: &Value, group_id: Option<i64>) -> Option<(Seg, UserInfo)> {
        let group_id = group_id?;
        let sub_type = raw.get("sub_type").and_then(|v| v.as_str()).unwrap_or("");
        let sender_id = raw.get("sender_id").and_then(|v| v.as_i64());
        let operator_id = raw.get("operator_id").and_then(|v| v.as_i64()).unwrap_or(0);
        let message_id = raw.get("message_id").cloned().unwrap_or(Value::Null);

        let operator_info = self.member_user_info(group_id, operator_id).await;
        let sender_name = match sender_id {
            Some(sender_id) => self.member_display_name(group_id, sender_id).await,
            None => "未知用户".to_string(),
        };

        let action = match sub_type {
            "add" => format!("将 {sender_name} 的消息设为精华"),
            "delete" => format!("移除了 {sender_name} 的精华消息"),
            _ => "精华消息变动".to_string(),
        };

        let segment = Seg::Notify(json!({
            "sub_type": "essence",
            "action": action,
            "essence_type": sub_type,
            "sender_id": sender_id,
            "message_id": message_id,
        }));
        Some((segment, operator_info))
    }

    // ------------------------------------------------------------------
    // Identity helpers
    // ------------------------------------------------------------------

    async fn resolve_group(&self, group_id: i64) -> Option<GroupInfo> {
        let group_name = match self.gateway.get_group_info(group_id).await {
            Some(info) => info
                .get("group_name")
                .and_then(|n| n.as_str())
                .map(String::from),
            None => {
                warn!(group_id, "cannot resolve group name for notice");
                None
            }
        };
        Some(GroupInfo {
            platform: self.platform(),
            group_id,
            group_name,
        })
    }

    async fn member_user_info(&self, group_id: i64, user_id: i64) -> UserInfo {
        match self.gateway.get_member_info(group_id, user_id).await {
            Some(info) => UserInfo {
                platform: self.platform(),
                user_id,
                user_nickname: Some(
                    info.get("nickname")
                        .and_then(|n| n.as_str())
                        .unwrap_or(FALLBACK_NICKNAME)
                        .to_string(),
                ),
                user_cardname: info.get("card").and_then(|c| c.as_str()).map(String::from),
            },
            None => {
                warn!(user_id, "cannot resolve member info");
                UserInfo {
                    platform: self.platform(),
                    user_id,
                    user_nickname: Some(FALLBACK_NICKNAME.to_string()),
                    user_cardname: None,
                }
            }
        }
    }

    async fn member_display_name(&self, group_id: i64, user_id: i64) -> String {
        match self.gateway.get_member_info(group_id, user_id).await {
            Some(info) => {
                let card = info.get("card").and_then(|c| c.as_str()).unwrap_or("");
                if !card.is_empty() {
                    card.to_string()
                } else {
                    info.get("nickname")
                        .and_then(|n| n.as_str())
                        .unwrap_or("未知")
                        .to_string()
                }
            }
            None => "未知".to_string(),
        }
    }
}

//! Admission control for inbound traffic.
//!
//! Consults the chat white/blacklists and the global ban list, and, when
//! `ban_qq_bot` is on, resolves whether the sender is an official platform
//! bot via a member-info query, cached per user id.

use crate::config::ConfigManager;
use crate::gateway::GatewayLink;

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct ChatGate {
    config: Arc<ConfigManager>,
    gateway: Arc<GatewayLink>,
    /// user_id → is_robot. Lazily filled; purely an optimization and safe
    /// to drop at any time.
    bot_ids: DashMap<i64, bool>,
}

impl ChatGate {
    pub fn new(config: Arc<ConfigManager>, gateway: Arc<GatewayLink>) -> Self {
        Self {
            config,
            gateway,
            bot_ids: DashMap::new(),
        }
    }

    /// Whether a message from `user_id` (in `group_id`, if any) may proceed.
    ///
    /// `ignore_bot` skips the robot check (notices about a user are not sent
    /// by that user); `ignore_global_list` skips the global ban list (poke
    /// targets may be banned senders).
    pub async fn allow_to_chat(
        &self,
        user_id: i64,
        group_id: Option<i64>,
        ignore_bot: bool,
        ignore_global_list: bool,
    ) -> bool {
        debug!(user_id, ?group_id, "checking chat admission");
        let chat = self.config.snapshot().chat.clone();

        match group_id {
            Some(group_id) => {
                if !chat.allows_group(group_id) {
                    warn!(group_id, "group not admitted by list, message dropped");
                    return false;
                }
            }
            None => {
                if !chat.allows_private(user_id) {
                    warn!(user_id, "private chat not admitted by list, message dropped");
                    return false;
                }
            }
        }

        if !ignore_global_list && chat.ban_user_id.contains(&user_id) {
            warn!(user_id, "sender on the global ban list, message dropped");
            return false;
        }

        if chat.ban_qq_bot && !ignore_bot {
            if let Some(group_id) = group_id {
                if self.sender_is_robot(group_id, user_id).await {
                    warn!(user_id, "official bot message intercepted and dropped");
                    return false;
                }
            }
        }

        true
    }

    async fn sender_is_robot(&self, group_id: i64, user_id: i64) -> bool {
        if let Some(cached) = self.bot_ids.get(&user_id) {
            return *cached;
        }
        let Some(member) = self.gateway.get_member_info(group_id, user_id).await else {
            warn!(user_id, "cannot resolve robot status, assuming human");
            return false;
        };
        match member.get("is_robot").and_then(|v| v.as_bool()) {
            Some(is_robot) => {
                self.bot_ids.insert(user_id, is_robot);
                is_robot
            }
            None => {
                warn!(user_id, "robot status absent from member info, assuming human");
                false
            }
        }
    }
}

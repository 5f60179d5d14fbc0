use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::defaults::*;

/// `[gateway]`: the OneBot-side WebSocket server we expose.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bind host for the gateway listener.
    pub host: String,
    /// Bind port for the gateway listener.
    pub port: u16,
    /// Bearer token required from the gateway. Empty disables the check.
    pub token: String,
    /// Expected heartbeat interval in seconds, until the gateway advertises its own.
    pub heartbeat_interval: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_GATEWAY_HOST.to_string(),
            port: DEFAULT_GATEWAY_PORT,
            token: String::new(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

/// Connection mode towards the upstream core service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreMode {
    Legacy,
    ApiClient,
}

/// `[core]`: the upstream bot service we connect to as a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Connection mode. `enable_api_server = true` forces `api_client` for
    /// configs written against the older flag.
    pub mode: CoreMode,
    pub host: String,
    pub port: u16,
    /// Platform identifier stamped on every envelope we produce.
    pub platform_name: String,
    /// Full WebSocket URL used in api_client mode.
    pub base_url: String,
    pub api_key: String,
    pub enable_api_server: bool,
}

impl CoreConfig {
    /// Effective mode after folding in the legacy `enable_api_server` flag.
    pub fn effective_mode(&self) -> CoreMode {
        if self.enable_api_server {
            CoreMode::ApiClient
        } else {
            self.mode
        }
    }

    /// WebSocket URL for the selected mode.
    pub fn url(&self) -> String {
        match self.effective_mode() {
            CoreMode::Legacy => format!("ws://{}:{}/ws", self.host, self.port),
            CoreMode::ApiClient => self.base_url.clone(),
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            mode: CoreMode::Legacy,
            host: DEFAULT_CORE_HOST.to_string(),
            port: DEFAULT_CORE_PORT,
            platform_name: DEFAULT_PLATFORM_NAME.to_string(),
            base_url: String::new(),
            api_key: String::new(),
            enable_api_server: false,
        }
    }
}

/// Whether an id list acts as a whitelist or a blacklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListType {
    Whitelist,
    Blacklist,
}

/// `[chat]`: admission control for inbound traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    pub group_list_type: ListType,
    pub group_list: BTreeSet<i64>,
    pub private_list_type: ListType,
    pub private_list: BTreeSet<i64>,
    /// Globally banned sender ids.
    pub ban_user_id: BTreeSet<i64>,
    /// Drop messages from official platform bots.
    pub ban_qq_bot: bool,
    pub enable_poke: bool,
}

impl ChatConfig {
    /// Admission check against the group list.
    pub fn allows_group(&self, group_id: i64) -> bool {
        match self.group_list_type {
            ListType::Whitelist => self.group_list.contains(&group_id),
            ListType::Blacklist => !self.group_list.contains(&group_id),
        }
    }

    /// Admission check against the private list.
    pub fn allows_private(&self, user_id: i64) -> bool {
        match self.private_list_type {
            ListType::Whitelist => self.private_list.contains(&user_id),
            ListType::Blacklist => !self.private_list.contains(&user_id),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            group_list_type: ListType::Blacklist,
            group_list: BTreeSet::new(),
            private_list_type: ListType::Blacklist,
            private_list: BTreeSet::new(),
            ban_user_id: BTreeSet::new(),
            ban_qq_bot: false,
            enable_poke: true,
        }
    }
}

/// `[voice]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct VoiceConfig {
    /// Allow outbound voice segments (requires a TTS-capable core).
    pub use_tts: bool,
}

/// `[forward]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Below this image count, forward-message images resolve to base64;
    /// at or above it they collapse to text placeholders.
    pub image_threshold: usize,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            image_threshold: DEFAULT_FORWARD_IMAGE_THRESHOLD,
        }
    }
}

/// `[debug]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level name (`trace`/`debug`/`info`/`warn`/`error`).
    pub level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

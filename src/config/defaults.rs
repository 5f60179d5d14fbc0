/// Default configuration constants used across the system.

/// Default gateway bind host.
pub const DEFAULT_GATEWAY_HOST: &str = "0.0.0.0";

/// Default gateway bind port.
pub const DEFAULT_GATEWAY_PORT: u16 = 8095;

/// Default expected heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Default core service host (legacy mode).
pub const DEFAULT_CORE_HOST: &str = "127.0.0.1";

/// Default core service port (legacy mode).
pub const DEFAULT_CORE_PORT: u16 = 8000;

/// Default platform identifier.
pub const DEFAULT_PLATFORM_NAME: &str = "qq";

/// Default forward-message image threshold.
pub const DEFAULT_FORWARD_IMAGE_THRESHOLD: usize = 5;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// Debounce window for config-file change bursts.
pub const RELOAD_DEBOUNCE_MS: u64 = 500;

mod defaults;
mod manager;
mod types;
mod watch;

pub use defaults::*;
pub use manager::{ChangeCallback, ConfigManager};
pub use types::*;
pub use watch::ConfigWatch;

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Errors produced by the configuration layer.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("unknown config path: {0}")]
    UnknownPath(String),
    #[error("config watcher error: {0}")]
    Watch(#[from] notify::Error),
}

/// Top-level adapter configuration. Immutable snapshot; the manager swaps
/// the whole value atomically on reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub core: CoreConfig,
    pub chat: ChatConfig,
    pub voice: VoiceConfig,
    pub forward: ForwardConfig,
    pub debug: DebugConfig,
}

impl Config {
    /// Load configuration from a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Write the default configuration to a file.
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).expect("default config serializes");
        std::fs::write(path, toml)?;
        info!("Wrote default config to {}", path.display());
        Ok(())
    }

    /// Apply environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("LOBSTERBRIDGE_GATEWAY_PORT") {
            if let Ok(port) = port.parse() {
                self.gateway.port = port;
            }
        }

        if let Ok(host) = std::env::var("LOBSTERBRIDGE_GATEWAY_HOST") {
            self.gateway.host = host;
        }

        if let Ok(token) = std::env::var("LOBSTERBRIDGE_GATEWAY_TOKEN") {
            self.gateway.token = token;
        }

        if let Ok(key) = std::env::var("LOBSTERBRIDGE_CORE_API_KEY") {
            self.core.api_key = key;
        }
    }
}

/// Validation errors surfaced by `config validate`.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Validate a configuration object.
pub fn validate_config(config: &Config) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    if config.gateway.port == 0 {
        errors.push(ConfigValidationError {
            path: "gateway.port".to_string(),
            message: "port must be greater than 0".to_string(),
        });
    }

    if config.core.effective_mode() == CoreMode::ApiClient {
        if config.core.base_url.is_empty() {
            errors.push(ConfigValidationError {
                path: "core.base_url".to_string(),
                message: "api_client mode requires a base_url".to_string(),
            });
        }
        if config.core.api_key.is_empty() {
            errors.push(ConfigValidationError {
                path: "core.api_key".to_string(),
                message: "api_client mode requires an api_key".to_string(),
            });
        }
    }

    if config.forward.image_threshold == 0 {
        errors.push(ConfigValidationError {
            path: "forward.image_threshold".to_string(),
            message: "threshold of 0 disables all forward images; use 1 or higher".to_string(),
        });
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [gateway]
            port = 9001

            [chat]
            group_list_type = "whitelist"
            group_list = [123]
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9001);
        assert_eq!(config.gateway.host, DEFAULT_GATEWAY_HOST);
        assert!(config.chat.allows_group(123));
        assert_eq!(config.forward.image_threshold, DEFAULT_FORWARD_IMAGE_THRESHOLD);
    }

    #[test]
    fn api_client_mode_requires_credentials() {
        let config: Config = toml::from_str(
            r#"
            [core]
            mode = "api_client"
            "#,
        )
        .unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.path == "core.base_url"));
        assert!(errors.iter().any(|e| e.path == "core.api_key"));
    }
}

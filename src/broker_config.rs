//! Broker configuration.
//!
//! Settings are layered file → environment → CLI. The file is TOML:
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//! dev_mode = false
//!
//! [registry]
//! superseded = "close"
//! outbound_buffer = 256
//!
//! [keepalive]
//! ping_interval_secs = 30
//! pong_timeout_secs = 60
//!
//! [logging]
//! level = "info"
//! json = false
//! directory = "logs"
//! ```
//!
//! Environment overrides: `BROKER_HOST`, `BROKER_PORT`, `LOG_LEVEL`,
//! `LOG_JSON`. A `.env` file in the working directory is loaded first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::BrokerError;
use crate::registry::SupersededPolicy;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "broker.toml";

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Permissive CORS and bind on all interfaces
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dev_mode: false,
        }
    }
}

impl ServerSection {
    /// Address to bind, taking dev mode into account.
    pub fn bind_addr(&self) -> String {
        let host = if self.dev_mode { "0.0.0.0" } else { self.host.as_str() };
        format!("{}:{}", host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySection {
    /// What to do with an agent's previous socket when it reconnects
    #[serde(default)]
    pub superseded: SupersededPolicy,
    /// Per-socket outbound queue depth; a full queue counts as a failed send
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_outbound_buffer() -> usize {
    256
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            superseded: SupersededPolicy::default(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepaliveSection {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_pong_timeout_secs() -> u64 {
    60
}

impl Default for KeepaliveSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

impl KeepaliveSection {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_secs(self.pong_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write daily-rolling log files into this directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            directory: None,
        }
    }
}

/// Root of `broker.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub keepalive: KeepaliveSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl BrokerConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path).map_err(|source| BrokerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, BrokerError> {
        toml::from_str(content).map_err(BrokerError::ConfigParse)
    }

    /// Load `path`, or defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, BrokerError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;

        let content = toml::to_string_pretty(self).context("Failed to serialize broker.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), BrokerError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to resolve variables.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), BrokerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("BROKER_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("BROKER_PORT") {
            self.server.port = port.parse().map_err(|_| BrokerError::InvalidEnv {
                key: "BROKER_PORT".to_string(),
                value: port.clone(),
            })?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("LOG_JSON") {
            self.logging.json = match json.to_lowercase().as_str() {
                "true" | "1" => true,
                "false" | "0" => false,
                _ => {
                    return Err(BrokerError::InvalidEnv {
                        key: "LOG_JSON".to_string(),
                        value: json,
                    });
                }
            };
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.server.port == 0 {
            warnings.push("server.port is 0: an ephemeral port will be chosen".to_string());
        }

        if self.registry.outbound_buffer == 0 {
            warnings.push("registry.outbound_buffer is 0: treated as 1".to_string());
        }

        if self.keepalive.ping_interval_secs == 0 {
            warnings.push("keepalive.ping_interval_secs must be greater than 0".to_string());
        }

        if self.keepalive.pong_timeout_secs <= self.keepalive.ping_interval_secs {
            warnings.push(format!(
                "keepalive.pong_timeout_secs ({}) should exceed ping_interval_secs ({})",
                self.keepalive.pong_timeout_secs, self.keepalive.ping_interval_secs
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            warnings.push(format!(
                "Invalid logging.level '{}': expected one of {}",
                self.logging.level,
                VALID_LOG_LEVELS.join(", ")
            ));
        }

        warnings
    }
}

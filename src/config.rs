//! # Configuration Management
//!
//! Centralized configuration for the map router.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables via `from_env()` (prefix `MAP_ROUTER_`)
//! - Direct instantiation with defaults
//!
//! ## Wire Constants
//! The datagram layout constants below are fixed by the game client and are
//! not configurable.

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Size of the plaintext datagram header.
pub const HEADER_SIZE: usize = 28;

/// Size of the trailing MD5 checksum.
pub const CHECKSUM_SIZE: usize = 16;

/// Size of the little-endian bit count stored before the checksum.
pub const BIT_COUNT_SIZE: usize = 4;

/// Largest datagram the client accepts or sends.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

/// Hard cap on sub-packets packed into one outbound datagram.
pub const MAX_SUBPACKETS_PER_DATAGRAM: usize = 10;

/// Default interval between outbound flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(50);

/// Main router configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RouterConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub outbound: OutboundConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RouterConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("MAP_ROUTER_BIND_ADDRESS") {
            config.server.bind_address = addr;
        }

        if let Ok(path) = std::env::var("MAP_ROUTER_RESOURCE_PATH") {
            config.codec.resource_path = PathBuf::from(path);
        }

        if let Ok(interval) = std::env::var("MAP_ROUTER_FLUSH_INTERVAL_MS") {
            let val = interval.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid MAP_ROUTER_FLUSH_INTERVAL_MS: {e}"))
            })?;
            config.outbound.flush_interval = Duration::from_millis(val);
        }

        if let Ok(timeout) = std::env::var("MAP_ROUTER_IDLE_TIMEOUT_MS") {
            let val = timeout.parse::<u64>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid MAP_ROUTER_IDLE_TIMEOUT_MS: {e}"))
            })?;
            config.session.idle_timeout = Duration::from_millis(val);
        }

        if let Ok(max) = std::env::var("MAP_ROUTER_MAX_SESSIONS") {
            config.server.max_sessions = max.parse::<usize>().map_err(|e| {
                ProtocolError::ConfigError(format!("Invalid MAP_ROUTER_MAX_SESSIONS: {e}"))
            })?;
        }

        if let Ok(level) = std::env::var("MAP_ROUTER_LOG_LEVEL") {
            config.logging.log_level = level.parse::<Level>().map_err(|_| {
                ProtocolError::ConfigError(format!("Invalid MAP_ROUTER_LOG_LEVEL: {level}"))
            })?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The defaults rendered as TOML, used by `--print-config`.
    pub fn example_config() -> String {
        Self::default()
            .to_toml()
            .unwrap_or_else(|e| format!("# defaults unavailable: {e}\n"))
    }

    /// Render this configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Cannot render config: {e}")))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|e| {
            ProtocolError::ConfigError(format!("Cannot write {}: {e}", path.display()))
        })
    }

    /// Validate the configuration. An empty list means it is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.codec.validate());
        errors.extend(self.session.validate());
        errors.extend(self.outbound.validate());
        errors.extend(self.bus.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// UDP listener configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Listen address (e.g., "0.0.0.0:54230")
    pub bind_address: String,

    /// Size of each receive buffer
    pub recv_buffer_size: usize,

    /// How long in-flight datagram tasks may run after shutdown is requested
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Maximum number of live sessions
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: String::from("0.0.0.0:54230"),
            recv_buffer_size: MAX_DATAGRAM_SIZE,
            shutdown_timeout: Duration::from_secs(5),
            max_sessions: 4096,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.bind_address.is_empty() {
            errors.push("Bind address cannot be empty".to_string());
        } else if self.bind_address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid bind address format: '{}' (expected format: '0.0.0.0:54230')",
                self.bind_address
            ));
        }

        if self.recv_buffer_size < MAX_DATAGRAM_SIZE {
            errors.push(format!(
                "Receive buffer too small: {} (minimum: {MAX_DATAGRAM_SIZE})",
                self.recv_buffer_size
            ));
        }

        if self.shutdown_timeout.as_secs() > 60 {
            errors.push("Shutdown timeout too long (maximum: 60s)".to_string());
        }

        if self.max_sessions == 0 {
            errors.push("Max sessions must be greater than 0".to_string());
        }

        errors
    }
}

/// Compression resource location
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CodecConfig {
    /// Directory containing compress.dat and decompress.dat
    pub resource_path: PathBuf,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            resource_path: PathBuf::from("resources"),
        }
    }
}

impl CodecConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.resource_path.as_os_str().is_empty() {
            errors.push("Codec resource path cannot be empty".to_string());
        }
        errors
    }
}

/// One-byte key tweak applied to first logins.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct KeyAdjustmentConfig {
    /// Byte offset into the 20-byte key
    pub index: usize,
    /// Wrapping amount added to that byte
    pub delta: u8,
}

/// Session lifetime configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    /// Sessions idle for longer than this are evicted
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// How often the idle sweep runs
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Optional adjustment applied to keys of first-login characters
    #[serde(default)]
    pub first_login_key_adjustment: Option<KeyAdjustmentConfig>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            first_login_key_adjustment: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.idle_timeout.as_millis() < 1000 {
            errors.push("Idle timeout too short (minimum: 1s)".to_string());
        }

        if self.sweep_interval.as_millis() < 100 {
            errors.push("Sweep interval too short (minimum: 100ms)".to_string());
        } else if self.sweep_interval > self.idle_timeout {
            errors.push("Sweep interval cannot exceed the idle timeout".to_string());
        }

        if let Some(adjust) = self.first_login_key_adjustment {
            if adjust.index >= crate::core::blowfish::KEY_SIZE {
                errors.push(format!(
                    "Key adjustment index {} outside the {}-byte key",
                    adjust.index,
                    crate::core::blowfish::KEY_SIZE
                ));
            }
        }

        errors
    }
}

/// Outbound batching configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundConfig {
    /// Interval between queue flushes
    #[serde(with = "duration_serde")]
    pub flush_interval: Duration,

    /// Sub-packets per datagram (at most 10)
    pub max_subpackets_per_datagram: usize,

    /// Queued sub-packets kept per client before the oldest are dropped
    pub backlog_limit: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_subpackets_per_datagram: MAX_SUBPACKETS_PER_DATAGRAM,
            backlog_limit: 100,
        }
    }
}

impl OutboundConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.flush_interval.as_millis() < 1 {
            errors.push("Flush interval too short (minimum: 1ms)".to_string());
        } else if self.flush_interval.as_secs() > 1 {
            errors.push("Flush interval too long (maximum: 1s)".to_string());
        }

        if self.max_subpackets_per_datagram == 0
            || self.max_subpackets_per_datagram > MAX_SUBPACKETS_PER_DATAGRAM
        {
            errors.push(format!(
                "Sub-packets per datagram must be 1-{MAX_SUBPACKETS_PER_DATAGRAM}, got {}",
                self.max_subpackets_per_datagram
            ));
        }

        if self.backlog_limit == 0 {
            errors.push("Backlog limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Wire format used on the message bus
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusFormat {
    #[default]
    Bincode,
    Json,
}

/// Message bus configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Capacity of each bus channel
    pub channel_capacity: usize,

    /// Encoding of routed packets
    pub format: BusFormat,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            format: BusFormat::default(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.channel_capacity == 0 {
            errors.push("Bus channel capacity must be greater than 0".to_string());
        }
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Name reported in the startup log line
    pub app_name: String,

    /// Log level, overridden by RUST_LOG when set
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,

    /// Interval between metrics log lines; zero disables them
    #[serde(with = "duration_serde")]
    pub metrics_interval: Duration,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("map-router"),
            log_level: Level::INFO,
            json_format: false,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        errors
    }
}

/// Durations are written as whole milliseconds.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Levels are written lowercase ("info", "debug").
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        level.as_str().to_ascii_lowercase().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Level::from_str(&raw).map_err(|_| serde::de::Error::custom(format!("unknown log level `{raw}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(RouterConfig::default().validate().is_empty());
        assert!(RouterConfig::default().validate_strict().is_ok());
    }

    #[test]
    fn test_example_config_roundtrips() {
        let text = RouterConfig::example_config();
        let parsed = RouterConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.outbound.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(parsed.logging.log_level, Level::INFO);
        assert_eq!(parsed.bus.format, BusFormat::Bincode);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = RouterConfig::from_toml(
            r#"
            [server]
            bind_address = "127.0.0.1:6000"
            recv_buffer_size = 4096
            shutdown_timeout = 1000
            max_sessions = 10

            [session]
            idle_timeout = 30000
            sweep_interval = 1000
            first_login_key_adjustment = { index = 16, delta = 6 }
            "#,
        )
        .unwrap();

        assert_eq!(config.server.max_sessions, 10);
        assert_eq!(
            config.session.first_login_key_adjustment,
            Some(KeyAdjustmentConfig { index: 16, delta: 6 })
        );
        assert_eq!(config.outbound.max_subpackets_per_datagram, 10);
    }

    #[test]
    fn test_outbound_cap() {
        let config = RouterConfig::default_with_overrides(|c| {
            c.outbound.max_subpackets_per_datagram = 11;
        });
        let errors = config.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("1-10"));
    }

    #[test]
    fn test_adjustment_index_checked() {
        let config = RouterConfig::default_with_overrides(|c| {
            c.session.first_login_key_adjustment = Some(KeyAdjustmentConfig { index: 20, delta: 1 });
        });
        assert!(config.validate_strict().is_err());
    }
}

//! # Configuration Management
//!
//! Centralized configuration for the portal relay.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - `PORTAL_MUX_*` environment overrides
//!
//! ## Example
//! ```toml
//! [server]
//! name = "relay1"
//! text_address = "0.0.0.0:7455"
//! binary_address = "0.0.0.0:7456"
//!
//! [security]
//! secret = "change me"
//! max_serial_lifetime = 300000
//!
//! [[channels.static]]
//! name = "news"
//! direction = "out"
//!
//! [[channels.static]]
//! name = "drop/box"
//! password = "hunter2"
//! direction = "in"
//! ```

use crate::core::channel_name::ChannelName;
use crate::core::codec::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_LINE_LEN};
use crate::error::{PortalError, Result};
use crate::mux::directory::Direction;
use crate::utils::serial_registry::DEFAULT_MAX_LIFETIME;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default text protocol listen address
pub const DEFAULT_TEXT_ADDRESS: &str = "127.0.0.1:7455";

/// Default pending deliveries per connection
pub const DEFAULT_OUTBOUND_QUEUE_LIMIT: usize = 1024;

/// Main relay configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub channels: ChannelsConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| PortalError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| PortalError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| PortalError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `PORTAL_MUX_*` environment variables
    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PORTAL_MUX_TEXT_ADDRESS") {
            self.server.text_address = addr;
        }

        if let Ok(addr) = std::env::var("PORTAL_MUX_BINARY_ADDRESS") {
            self.server.binary_address = Some(addr).filter(|a| !a.is_empty());
        }

        if let Ok(name) = std::env::var("PORTAL_MUX_SERVER_NAME") {
            self.server.name = name;
        }

        if let Ok(max) = std::env::var("PORTAL_MUX_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                self.server.max_connections = val;
            }
        }

        if let Ok(secret) = std::env::var("PORTAL_MUX_SECRET") {
            self.security.secret = Some(secret);
        }

        if let Ok(lifetime) = std::env::var("PORTAL_MUX_SERIAL_LIFETIME_MS") {
            if let Ok(val) = lifetime.parse::<u64>() {
                self.security.max_serial_lifetime = Duration::from_millis(val);
            }
        }

        if let Ok(level) = std::env::var("PORTAL_MUX_LOG_LEVEL") {
            if let Ok(level) = level.parse::<Level>() {
                self.logging.log_level = level;
            }
        }
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

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| PortalError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| PortalError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.security.validate());
        errors.extend(self.channels.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(PortalError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Listener and connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server name sent in the `220` greeting
    pub name: String,

    /// Banner text following the name in the greeting
    pub banner: String,

    /// Text protocol listen address (e.g., "127.0.0.1:7455")
    pub text_address: String,

    /// Binary protocol listen address, disabled when unset
    pub binary_address: Option<String>,

    /// Maximum number of concurrent connections across both listeners
    pub max_connections: usize,

    /// Longest accepted text line in bytes, excluding CRLF
    pub max_line_length: usize,

    /// Largest accepted binary frame payload in bytes
    pub max_frame_length: usize,

    /// Pending deliveries per connection before new ones are dropped
    pub outbound_queue_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::from("portal-mux"),
            banner: format!("portal-mux {} ready", env!("CARGO_PKG_VERSION")),
            text_address: String::from(DEFAULT_TEXT_ADDRESS),
            binary_address: None,
            max_connections: 1000,
            max_line_length: DEFAULT_MAX_LINE_LEN,
            max_frame_length: DEFAULT_MAX_FRAME_LEN,
            outbound_queue_limit: DEFAULT_OUTBOUND_QUEUE_LIMIT,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() || self.name.contains(char::is_whitespace) {
            errors.push(format!(
                "Server name must be a single non-empty word: '{}'",
                self.name
            ));
        }

        for (label, address) in [
            ("text", Some(&self.text_address)),
            ("binary", self.binary_address.as_ref()),
        ] {
            let Some(address) = address else { continue };
            if address.is_empty() {
                errors.push(format!("{label} address cannot be empty"));
            } else if address.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!(
                    "Invalid {label} address format: '{address}' (expected format: '0.0.0.0:7455')"
                ));
            }
        }

        if self.binary_address.as_ref() == Some(&self.text_address) {
            errors.push("Text and binary listeners cannot share an address".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        if self.max_line_length < 64 {
            errors.push(format!(
                "Max line length too small: {} (minimum: 64)",
                self.max_line_length
            ));
        }

        if self.max_frame_length < 64 {
            errors.push(format!(
                "Max frame length too small: {} (minimum: 64)",
                self.max_frame_length
            ));
        } else if self.max_frame_length > i32::MAX as usize {
            errors.push(format!(
                "Max frame length too large: {} (maximum: {})",
                self.max_frame_length,
                i32::MAX
            ));
        }

        if self.outbound_queue_limit == 0 {
            errors.push("Outbound queue limit must be greater than 0".to_string());
        }

        errors
    }
}

/// Shared secret and serial lifetime
#[derive(Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// HMAC key shared by all relays; generated at startup when unset
    pub secret: Option<String>,

    /// How long an issued serial stays redeemable
    #[serde(with = "duration_serde")]
    pub max_serial_lifetime: Duration,

    /// Period of the expired-serial sweep
    #[serde(with = "duration_serde")]
    pub sweep_interval: Duration,

    /// Where serial state is saved on shutdown and loaded on start
    pub serial_state_path: Option<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_serial_lifetime: DEFAULT_MAX_LIFETIME,
            sweep_interval: Duration::from_secs(60),
            serial_state_path: None,
        }
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("secret", &self.secret.as_ref().map(|_| "[redacted]"))
            .field("max_serial_lifetime", &self.max_serial_lifetime)
            .field("sweep_interval", &self.sweep_interval)
            .field("serial_state_path", &self.serial_state_path)
            .finish()
    }
}

impl SecurityConfig {
    /// Validate security configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(secret) = &self.secret {
            if secret.is_empty() {
                errors.push("Shared secret cannot be empty (omit it to generate one)".to_string());
            } else if secret.len() < 8 {
                errors.push("WARNING: Shared secret shorter than 8 bytes".to_string());
            }
        }

        if self.max_serial_lifetime.as_secs() < 1 {
            errors.push("Serial lifetime too short (minimum: 1s)".to_string());
        } else if self.max_serial_lifetime.as_secs() > 86_400 {
            errors.push("Serial lifetime too long (maximum: 24 hours)".to_string());
        }

        if self.sweep_interval.as_millis() < 100 {
            errors.push("Sweep interval too short (minimum: 100ms)".to_string());
        }

        errors
    }
}

/// One channel created at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StaticChannel {
    pub name: ChannelName,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub direction: Direction,
}

/// Channel directory settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Delay between a flush request and the flush
    #[serde(with = "duration_serde")]
    pub update_delay: Duration,

    /// Longest a busy channel may go without flushing
    #[serde(with = "duration_serde")]
    pub max_update_delay: Duration,

    /// Submitted payloads held per inbound channel before re-emitting
    pub inbox_capacity: usize,

    /// Channels to register at startup
    #[serde(rename = "static")]
    pub static_channels: Vec<StaticChannel>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            update_delay: Duration::from_millis(50),
            max_update_delay: Duration::from_millis(1_000),
            inbox_capacity: 256,
            static_channels: Vec::new(),
        }
    }
}

impl ChannelsConfig {
    /// Validate channel configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_update_delay < self.update_delay {
            errors.push(format!(
                "max_update_delay ({}ms) cannot be shorter than update_delay ({}ms)",
                self.max_update_delay.as_millis(),
                self.update_delay.as_millis()
            ));
        }

        if self.inbox_capacity == 0 {
            errors.push("Inbox capacity must be greater than 0".to_string());
        }

        let mut seen = HashSet::new();
        for channel in &self.static_channels {
            if !seen.insert(&channel.name) {
                errors.push(format!("Duplicate channel: {}", channel.name));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("portal-mux"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
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

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Durations as integer milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

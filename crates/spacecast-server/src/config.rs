//! Server configuration.
//!
//! Configuration is layered, later sources winning:
//! - Built-in defaults
//! - The first TOML file found among [`CONFIG_PATHS`]
//! - Environment variables (`SPACECAST__PORT`, `SPACECAST__LIMITS__SEND_BUFFER`, ...)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spacecast_core::{HubConfig, ManagerConfig, SessionConfig};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file locations, in lookup order.
pub const CONFIG_PATHS: [&str; 3] = [
    "spacecast.toml",
    "/etc/spacecast/spacecast.toml",
    "~/.config/spacecast/spacecast.toml",
];

/// Prefix for environment overrides.
const ENV_PREFIX: &str = "SPACECAST";

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint paths.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Liveness timing.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Endpoint paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Space chat socket. Must contain the `:space_id` segment.
    #[serde(default = "default_space_path")]
    pub space_path: String,

    /// Notification socket.
    #[serde(default = "default_notifications_path")]
    pub notifications_path: String,

    /// Presence socket.
    #[serde(default = "default_presence_path")]
    pub presence_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum chat content length in characters.
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,

    /// Outbound queue capacity per space session.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Hub command mailbox capacity.
    #[serde(default = "default_hub_buffer")]
    pub hub_buffer: usize,

    /// Event bus capacity.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// Maximum concurrent notification users.
    #[serde(default = "default_max_connections")]
    pub max_notification_connections: usize,

    /// Maximum concurrent presence users.
    #[serde(default = "default_max_connections")]
    pub max_presence_connections: usize,
}

/// Liveness timing, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Deadline for each write.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,

    /// How long a connection may stay silent before it is dropped.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Interval between pings. Must be shorter than `pong_wait_ms`.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_space_path() -> String {
    "/ws/spaces/:space_id".to_string()
}

fn default_notifications_path() -> String {
    "/ws/notifications".to_string()
}

fn default_presence_path() -> String {
    "/ws/presence".to_string()
}

fn default_max_message_size() -> usize {
    8 * 1024
}

fn default_max_content_length() -> usize {
    spacecast_core::message::DEFAULT_MAX_CONTENT_LENGTH
}

fn default_send_buffer() -> usize {
    256
}

fn default_hub_buffer() -> usize {
    1024
}

fn default_event_buffer() -> usize {
    spacecast_core::events::DEFAULT_EVENT_CAPACITY
}

fn default_max_connections() -> usize {
    spacecast_core::registry::DEFAULT_MAX_CONNECTIONS
}

fn default_write_wait() -> u64 {
    10_000
}

fn default_pong_wait() -> u64 {
    60_000
}

fn default_ping_interval() -> u64 {
    54_000 // 9/10 of pong wait
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            space_path: default_space_path(),
            notifications_path: default_notifications_path(),
            presence_path: default_presence_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_content_length: default_max_content_length(),
            send_buffer: default_send_buffer(),
            hub_buffer: default_hub_buffer(),
            event_buffer: default_event_buffer(),
            max_notification_connections: default_max_connections(),
            max_presence_connections: default_max_connections(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            write_wait_ms: default_write_wait(),
            pong_wait_ms: default_pong_wait(),
            ping_interval_ms: default_ping_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, with
    /// environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged result
    /// is invalid.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).into_owned()))
            .find(|path| path.exists());

        Self::layered(file.as_deref())
    }

    /// Load configuration from `file` (if any) with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged result
    /// is invalid.
    pub fn layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder =
                builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
        }

        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("heartbeat.write_wait_ms", self.heartbeat.write_wait_ms),
            ("heartbeat.ping_interval_ms", self.heartbeat.ping_interval_ms),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        for (name, value) in [
            ("limits.send_buffer", self.limits.send_buffer),
            ("limits.event_buffer", self.limits.event_buffer),
        ] {
            if value == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }
        if self.heartbeat.ping_interval_ms >= self.heartbeat.pong_wait_ms {
            anyhow::bail!(
                "heartbeat.ping_interval_ms ({}) must be shorter than heartbeat.pong_wait_ms ({})",
                self.heartbeat.ping_interval_ms,
                self.heartbeat.pong_wait_ms
            );
        }
        if !self.transport.space_path.contains(":space_id") {
            anyhow::bail!(
                "transport.space_path must contain :space_id, got {}",
                self.transport.space_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }

    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_interval_ms),
            max_message_size: self.limits.max_message_size,
            send_buffer: self.limits.send_buffer,
        }
    }

    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_buffer: self.limits.hub_buffer,
        }
    }

    /// Manager settings with the given connection ceiling.
    #[must_use]
    pub fn manager_config(&self, max_connections: usize) -> ManagerConfig {
        ManagerConfig {
            max_connections,
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_interval_ms),
        }
    }
}

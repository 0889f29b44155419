//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (CHORUS_HOST, CHORUS_PORT, CHORUS_CONFIG)
//! - TOML configuration file

use anyhow::{Context, Result};
use chorus_core::PumpConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path of the WebSocket upgrade endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Directory holding `index.html` and other static assets.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Shutdown configuration.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound queue capacity per client.
    #[serde(default = "default_send_buffer")]
    pub send_buffer: usize,

    /// Capacity of the hub command channel.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Liveness window in milliseconds.
    #[serde(default = "default_pong_wait")]
    pub pong_wait_ms: u64,

    /// Ping interval in milliseconds. Must be below `pong_wait_ms`.
    #[serde(default = "default_ping_period")]
    pub ping_period_ms: u64,

    /// Write timeout in milliseconds.
    #[serde(default = "default_write_wait")]
    pub write_wait_ms: u64,
}

/// Shutdown configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to wait for connections to drain, in milliseconds.
    #[serde(default = "default_shutdown_timeout")]
    pub timeout_ms: u64,
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

// Default value functions
fn default_host() -> String {
    std::env::var("CHORUS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("CHORUS_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

fn default_max_message_size() -> usize {
    512
}

fn default_send_buffer() -> usize {
    256
}

fn default_hub_capacity() -> usize {
    1024
}

fn default_pong_wait() -> u64 {
    60_000 // 60 seconds
}

fn default_ping_period() -> u64 {
    54_000 // 9/10 of the pong wait
}

fn default_write_wait() -> u64 {
    10_000 // 10 seconds
}

fn default_shutdown_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            websocket_path: default_ws_path(),
            static_dir: default_static_dir(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            shutdown: ShutdownConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            send_buffer: default_send_buffer(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            pong_wait_ms: default_pong_wait(),
            ping_period_ms: default_ping_period(),
            write_wait_ms: default_write_wait(),
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_shutdown_timeout(),
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
    /// Load configuration from file or defaults.
    ///
    /// `CHORUS_CONFIG` names an explicit file; otherwise the usual locations
    /// are searched and the first existing file wins.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("CHORUS_CONFIG") {
            return Self::from_file(shellexpand::tilde(&path).as_ref());
        }

        let config_paths = [
            "chorus.toml",
            "/etc/chorus/chorus.toml",
            "~/.config/chorus/chorus.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
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

    /// Build the validated pump configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the limits or heartbeat timings are inconsistent.
    pub fn pump_config(&self) -> Result<PumpConfig> {
        let pump = PumpConfig {
            max_message_size: self.limits.max_message_size,
            send_buffer: self.limits.send_buffer,
            pong_wait: Duration::from_millis(self.heartbeat.pong_wait_ms),
            ping_period: Duration::from_millis(self.heartbeat.ping_period_ms),
            write_wait: Duration::from_millis(self.heartbeat.write_wait_ms),
        };
        pump.validate().context("Invalid heartbeat or limits configuration")?;
        Ok(pump)
    }

    /// Grace period for draining connections on shutdown.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown.timeout_ms)
    }
}

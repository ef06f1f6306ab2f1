//! Server configuration.
//!
//! Loaded from `snes-server.toml` in the platform config directory (see
//! [`crate::infrastructure::storage`]) and then overridden by command-line
//! flags.  Every section and field has a default so a partial or empty file
//! is valid.
//!
//! # Defaults
//!
//! | Field                         | Default             |
//! |-------------------------------|---------------------|
//! | `server.bind_address`         | `127.0.0.1`         |
//! | `server.port`                 | `23074`             |
//! | `server.port_retry_interval_ms` | `2000`            |
//! | `relay.mode`                  | `local`             |
//! | `relay.target`                | none                |
//! | `relay.socks_proxy`           | none                |
//! | `relay.connect_timeout_ms`    | `3000`              |
//! | `device.source`               | `hardware`          |
//! | `device.simulated_name`       | `SD2SNES SIM`       |
//! | `device.simulated_firmware`   | `1.11.0`            |
//! | `device.usb_vendor_id`        | `0x1209`            |
//! | `device.usb_product_id`       | `0x5A22`            |

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 23074;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine platform configuration directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// How inbound sessions are served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Serve every session from locally attached devices.
    #[default]
    Local,
    /// Relay every session to `relay.target`.
    Divert,
    /// Try to relay; serve locally when the target is unreachable.
    Fallback,
}

impl ServerMode {
    pub fn relays(self) -> bool {
        self != ServerMode::Local
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServerMode::Local => "local",
            ServerMode::Divert => "divert",
            ServerMode::Fallback => "fallback",
        })
    }
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(ServerMode::Local),
            "divert" => Ok(ServerMode::Divert),
            "fallback" => Ok(ServerMode::Fallback),
            other => Err(format!("unknown mode {other:?} (expected local, divert or fallback)")),
        }
    }
}

/// Where device handlers come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    /// USB enumeration plus serial port probing.
    #[default]
    Hardware,
    /// One in-memory device.
    Simulated,
}

impl FromStr for DeviceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hardware" => Ok(DeviceSource::Hardware),
            "simulated" => Ok(DeviceSource::Simulated),
            other => Err(format!("unknown device source {other:?}")),
        }
    }
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// `0` asks the OS for an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Pause between bind attempts while the port is taken.
    #[serde(default = "default_port_retry_interval_ms")]
    pub port_retry_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub mode: ServerMode,
    /// Upstream `ws://host:port` endpoint.
    #[serde(default)]
    pub target: Option<String>,
    /// SOCKS5 proxy `host:port` used to reach the target.
    #[serde(default)]
    pub socks_proxy: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub source: DeviceSource,
    #[serde(default = "default_simulated_name")]
    pub simulated_name: String,
    #[serde(default = "default_simulated_firmware")]
    pub simulated_firmware: String,
    #[serde(default = "default_usb_vendor_id")]
    pub usb_vendor_id: u16,
    #[serde(default = "default_usb_product_id")]
    pub usb_product_id: u16,
    /// Serial ports probed when USB enumeration finds nothing.
    #[serde(default = "default_serial_candidates")]
    pub serial_candidates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            port_retry_interval_ms: default_port_retry_interval_ms(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mode: ServerMode::default(),
            target: None,
            socks_proxy: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            source: DeviceSource::default(),
            simulated_name: default_simulated_name(),
            simulated_firmware: default_simulated_firmware(),
            usb_vendor_id: default_usb_vendor_id(),
            usb_product_id: default_usb_product_id(),
            serial_candidates: default_serial_candidates(),
        }
    }
}

impl ServerConfig {
    /// Parses `bind_address:port`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] when the bind address is not an IP address.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.server.bind_address, self.server.port)
            .parse()
            .map_err(|e| {
                ConfigError::Invalid(format!(
                    "bad listen address {}:{}: {e}",
                    self.server.bind_address, self.server.port
                ))
            })
    }

    pub fn port_retry_interval(&self) -> Duration {
        Duration::from_millis(self.server.port_retry_interval_ms)
    }

    pub fn relay_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.relay.connect_timeout_ms)
    }

    /// Checks cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first violated constraint.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.listen_addr()?;
        if self.server.port_retry_interval_ms == 0 {
            return Err(ConfigError::Invalid("port_retry_interval_ms must be non-zero".into()));
        }
        match (&self.relay.target, self.relay.mode.relays()) {
            (None, true) => {
                return Err(ConfigError::Invalid(format!(
                    "{} mode needs relay.target",
                    self.relay.mode
                )))
            }
            (Some(target), true) if !target.starts_with("ws://") => {
                return Err(ConfigError::Invalid(format!(
                    "relay.target {target:?} must be a ws:// endpoint"
                )))
            }
            _ => {}
        }
        if self.relay.socks_proxy.is_some() && !self.relay.mode.relays() {
            return Err(ConfigError::Invalid(
                "relay.socks_proxy is only used in divert or fallback mode".into(),
            ));
        }
        Ok(())
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_port_retry_interval_ms() -> u64 {
    2000
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_simulated_name() -> String {
    "SD2SNES SIM".to_string()
}

fn default_simulated_firmware() -> String {
    "1.11.0".to_string()
}

fn default_usb_vendor_id() -> u16 {
    0x1209
}

fn default_usb_product_id() -> u16 {
    0x5A22
}

fn default_serial_candidates() -> Vec<String> {
    #[cfg(target_os = "windows")]
    {
        (3..=9).map(|n| format!("COM{n}")).collect()
    }
    #[cfg(target_os = "macos")]
    {
        vec!["/dev/cu.usbmodem1".to_string(), "/dev/cu.usbmodem2".to_string()]
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        (0..4).map(|n| format!("/dev/ttyACM{n}")).collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

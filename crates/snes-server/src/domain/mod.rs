//! Server domain types: configuration and device identities.

pub mod config;
pub mod identity;

pub use config::{ConfigError, DeviceConfig, DeviceSource, ListenConfig, RelayConfig, ServerConfig, ServerMode};
pub use identity::DeviceIdentity;

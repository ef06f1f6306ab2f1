//! snes-server library crate.
//!
//! A usb2snes-compatible WebSocket server that multiplexes many client
//! sessions over the SD2SNES/FXPak devices attached to this machine, or
//! relays them to another server.
//!
//! # Architecture
//!
//! ```text
//! usb2snes clients (JSON + binary over WebSocket, or in-process channels)
//!         ↕
//! [snes-server]
//!   ├── domain/           ServerConfig, DeviceIdentity
//!   ├── application/      Per-session dispatch: request → device handler
//!   └── infrastructure/
//!         ├── ws_server/  Bind with retry, accept loop, divert/fallback
//!         ├── session/    Frame loop for one client
//!         ├── relay/      Upstream dial (direct or SOCKS5) and frame copying
//!         ├── pool/       Shared, reference-counted device handlers
//!         ├── device/     512-byte packet codec over serial or simulated links
//!         ├── embedded/   Connector that serves sessions in-process
//!         └── storage/    TOML config file
//! ```
//!
//! # Sharing devices (for beginners)
//!
//! Several programs often want the same cartridge at once (an auto-tracker
//! and a timer, say).  The serial port can only be opened once, so the
//! server opens it once per device and hands every attached session a lease
//! on the same handler.  An async mutex around the handler keeps one
//! session's command and data phases from interleaving with another's.

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::{DeviceIdentity, ServerConfig, ServerMode};
pub use infrastructure::embedded::EmbeddedConnector;
pub use infrastructure::ws_server::{Server, ServerHandle, ServerStatus};

//! # snes-core
//!
//! Shared library for SNES-Link containing the usb2snes wire protocol, the
//! 512-byte hardware packet codec, domain entities, and the frame transports
//! that carry the protocol between processes.
//!
//! This crate is used by both the client engine and the embedded server.
//!
//! # Architecture overview (for beginners)
//!
//! SNES-Link lets a desktop application talk to an SD2SNES/FXPak cartridge
//! plugged into a Super Nintendo.  The cartridge exposes a USB serial port that
//! speaks a compact binary protocol: fixed 512-byte command packets.  On top of
//! that sits the "usb2snes" protocol, a JSON-plus-binary WebSocket protocol
//! that many community tools already speak.
//!
//! This crate is the shared foundation.  It defines:
//!
//! - **`protocol`** – How bytes travel.  The JSON envelope (`wire`), the
//!   hardware packet codec (`packet`), directory listing records (`listing`),
//!   and IPS patch decoding (`ips`).
//!
//! - **`domain`** – Pure logic with no I/O: address constants and the WRAM
//!   translation, the CMD-space program assembler, device identities, and the
//!   connection state machine that gates every operation.
//!
//! - **`transport`** – The [`transport::FrameTransport`] abstraction with a
//!   WebSocket implementation and an in-memory channel pair used for embedding
//!   and testing.
//!
//! - **`retry`** – One reusable retry/backoff combinator.
//!
//! - **`error`** – The error taxonomy surfaced to callers of the operation
//!   contract.

pub mod domain;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod transport;

// Re-export the most-used types at the crate root so callers can write
// `snes_core::Opcode` instead of `snes_core::protocol::wire::Opcode`.
pub use domain::device::{DeviceInfo, DirEntry, EntryKind, FirmwareGeneration};
pub use domain::outcome::OperationOutcome;
pub use domain::state::{ensure_ready, ConnectionState, Operation};
pub use error::ContractError;
pub use protocol::wire::{Opcode, Space, WireReply, WireRequest};
pub use retry::{retry, Backoff, RetryPolicy};
pub use transport::{Connector, Frame, FrameTransport, TransportError};

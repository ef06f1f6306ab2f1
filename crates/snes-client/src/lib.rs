//! # snes-client
//!
//! Client side of the usb2snes protocol stack.
//!
//! Game integrations program against [`OperationContract`].  The
//! [`TransportSelector`] decides at runtime which implementation serves those
//! calls; the usual one is [`ProtocolEngine`], which speaks the protocol to a
//! usb2snes-compatible server over WebSocket.
//!
//! ```no_run
//! use std::sync::Arc;
//! use snes_client::{OperationContract, ProtocolEngine, TransportKind, TransportSelector};
//!
//! # async fn demo() -> Result<(), snes_core::ContractError> {
//! let mut selector = TransportSelector::new();
//! selector.register(TransportKind::Usb2Snes, || Arc::new(ProtocolEngine::websocket()));
//! selector.select(TransportKind::Usb2Snes)?;
//!
//! selector.connect("ws://localhost:23074").await?;
//! let devices = selector.list_devices().await?;
//! selector.attach(&devices[0]).await?;
//! let frame_counter = selector.read_memory(0xF5001A, 1).await?;
//! # let _ = frame_counter;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use application::contract::OperationContract;
pub use application::selector::{TransportKind, TransportSelector};
pub use domain::config::{EngineConfig, DEFAULT_ENDPOINT};
pub use domain::transfer::{CancelHandle, TransferOptions, TransferProgress, TransferReport};
pub use domain::watch::{MemoryChange, WatchCondition, WatchOptions, WatchTarget};
pub use infrastructure::engine::ProtocolEngine;
pub use infrastructure::watcher::{MemoryWatcher, WatchExt};

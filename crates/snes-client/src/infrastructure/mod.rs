//! Infrastructure layer of the client.
//!
//! - **`engine`** – [`engine::ProtocolEngine`], the operation contract spoken
//!   over a [`snes_core::FrameTransport`].
//! - **`watcher`** – [`watcher::MemoryWatcher`], a restartable polling task.

pub mod engine;
pub mod watcher;

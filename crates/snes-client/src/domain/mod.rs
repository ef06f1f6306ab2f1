//! Client-side domain types: engine configuration, transfer options, and
//! memory-watch descriptions.  Nothing here performs I/O.

pub mod config;
pub mod transfer;
pub mod watch;

pub use config::EngineConfig;
pub use transfer::{CancelHandle, ProgressSink, TransferOptions, TransferProgress, TransferReport};
pub use watch::{ChangeCallback, MemoryChange, WatchCondition, WatchOptions, WatchTarget};

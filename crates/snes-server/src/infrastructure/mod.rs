//! Infrastructure layer: sockets, serial ports, and the session machinery.

pub mod device;
pub mod embedded;
pub mod pool;
pub mod relay;
pub mod session;
pub mod storage;
pub mod ws_server;

pub use pool::{DeviceLease, DevicePool};
pub use session::handle_session;

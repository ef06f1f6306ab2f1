//! Application layer: what one client session does with its requests.
//!
//! The session loop in [`crate::infrastructure::session`] owns the transport
//! and frames; [`dispatch::Session`] owns the per-session state (client name,
//! device lease) and decides the reply for each request.

pub mod dispatch;

pub use dispatch::{Reply, Session, SessionError, APP_VERSION};

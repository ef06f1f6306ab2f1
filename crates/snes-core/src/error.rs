//! Error taxonomy shared by every implementation of the operation contract.
//!
//! Callers match on [`ContractError`] without knowing which transport is
//! active, so every implementation must map its failures onto these variants.

use std::time::Duration;

use thiserror::Error;

use crate::domain::state::{ConnectionState, Operation};
use crate::protocol::wire::WireError;
use crate::transport::TransportError;

/// Typed failure returned by every operation-contract call.
#[derive(Debug, Error)]
pub enum ContractError {
    /// The operation needs a connection state that has not been reached yet.
    #[error("{operation:?} requires {required:?} but connection is {current:?}")]
    NotReady {
        operation: Operation,
        required: ConnectionState,
        current: ConnectionState,
    },

    /// One request exceeded its deadline; the connection is kept.
    #[error("{operation:?} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    /// Consecutive timeouts crossed the hang threshold; the transport was torn down.
    #[error("transport hung after {consecutive} consecutive timeouts")]
    TransportHung { consecutive: u32 },

    /// The peer sent something that does not match the expected response shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A transfer moved a different number of bytes than declared.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The device is in use and cannot serve the request now.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// The session has not attached to a device.
    #[error("no device attached")]
    NoDeviceAttached,

    /// The listening port is already bound by another process.
    #[error("port {0} already in use")]
    PortInUse(u16),

    /// Invalid configuration (bad port, missing diversion target, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The path, or the device name, does not exist.
    #[error("not found on device: {0}")]
    NotFound(String),

    /// The requested transport kind has no registered implementation.
    #[error("transport '{0}' is not implemented")]
    NotImplemented(String),

    /// Switching implementations is refused while a connection is open.
    #[error("cannot switch transport while {0:?}; disconnect first")]
    SwitchWhileConnected(ConnectionState),

    /// A transfer was cancelled by its caller.
    #[error("transfer cancelled after {transferred} bytes")]
    Cancelled { transferred: u64 },

    /// Post-upload verification never found the destination file.
    #[error("upload verification failed for {path} after {attempts} attempts")]
    VerificationFailed { path: String, attempts: u32 },

    /// An argument is outside what the protocol or device accepts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Lower-level transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local file system failure while reading or writing a transfer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ContractError {
    /// Returns `true` for errors a bounded retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ContractError::Timeout { .. }
                | ContractError::NotFound(_)
                | ContractError::DeviceBusy(_)
                | ContractError::PortInUse(_)
        )
    }
}

impl From<WireError> for ContractError {
    fn from(e: WireError) -> Self {
        ContractError::Protocol(e.to_string())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_transient() {
        let e = ContractError::Timeout {
            operation: Operation::ReadMemory,
            after: Duration::from_secs(5),
        };
        assert!(e.is_transient());
    }

    #[test]
    fn test_hung_and_protocol_errors_are_not_transient() {
        assert!(!ContractError::TransportHung { consecutive: 3 }.is_transient());
        assert!(!ContractError::Protocol("bad".into()).is_transient());
        assert!(!ContractError::ConnectionClosed.is_transient());
    }

    #[test]
    fn test_not_ready_message_names_states() {
        let e = ContractError::NotReady {
            operation: Operation::ReadMemory,
            required: ConnectionState::Attached,
            current: ConnectionState::Connected,
        };
        let text = e.to_string();
        assert!(text.contains("Attached"));
        assert!(text.contains("Connected"));
    }
}

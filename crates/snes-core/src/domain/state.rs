//! Connection state machine and the readiness gate.
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──▶ Connected ──attach──▶ Attached
//!       ▲                                                            │
//!       └──────────────────────── disconnect / failure ◀─────────────┘
//! ```
//!
//! Every operation declares the minimum state it needs.  [`ensure_ready`] is
//! the single place that check happens, so all transports reject premature
//! calls with the same [`ContractError::NotReady`].

use crate::error::ContractError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Attached,
}

/// Every call of the operation contract, used for gating and error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Connect,
    Disconnect,
    ListDevices,
    Attach,
    SetClientName,
    AppVersion,
    Boot,
    Menu,
    Reset,
    Info,
    ReadMemory,
    WriteMemory,
    UploadFile,
    DownloadFile,
    ListDirectory,
    MakeDirectory,
    Remove,
    Rename,
    ApplyPatch,
    SaveState,
    LoadState,
    WatchMemory,
}

impl Operation {
    /// Minimum connection state the operation needs.
    pub fn required_state(self) -> ConnectionState {
        match self {
            Operation::Connect | Operation::Disconnect => ConnectionState::Disconnected,
            Operation::ListDevices
            | Operation::Attach
            | Operation::SetClientName
            | Operation::AppVersion
            | Operation::Boot
            | Operation::Menu
            | Operation::Reset => ConnectionState::Connected,
            _ => ConnectionState::Attached,
        }
    }
}

/// Fails with [`ContractError::NotReady`] unless `current` satisfies `operation`.
///
/// # Errors
///
/// Returns [`ContractError::NotReady`] when the state is below the requirement.
pub fn ensure_ready(operation: Operation, current: ConnectionState) -> Result<(), ContractError> {
    let required = operation.required_state();
    if current >= required {
        Ok(())
    } else {
        Err(ContractError::NotReady {
            operation,
            required,
            current,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

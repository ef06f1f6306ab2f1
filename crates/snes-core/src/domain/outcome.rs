//! Tagged result of one protocol exchange.
//!
//! Fire-and-forget opcodes resolve to [`OperationOutcome::Acknowledged`] and
//! carry no data; a peer that hangs up mid-exchange (the protocol's only
//! failure signal for `MakeDir`, `List` on a missing path, ...) resolves to
//! [`OperationOutcome::ConnectionClosed`].  Callers unwrap with
//! [`OperationOutcome::into_data`] or [`OperationOutcome::into_ack`], which
//! turn a shape mismatch into a typed error instead of a silent default.

use crate::error::ContractError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome<T> {
    Acknowledged,
    Result(T),
    ConnectionClosed,
}

impl<T> OperationOutcome<T> {
    /// Returns the data of a `Result` outcome.
    ///
    /// # Errors
    ///
    /// [`ContractError::Protocol`] for `Acknowledged`, and
    /// [`ContractError::ConnectionClosed`] for `ConnectionClosed`.
    pub fn into_data(self) -> Result<T, ContractError> {
        match self {
            Self::Result(data) => Ok(data),
            Self::Acknowledged => Err(ContractError::Protocol(
                "fire-and-forget operation has no result".into(),
            )),
            Self::ConnectionClosed => Err(ContractError::ConnectionClosed),
        }
    }

    /// Succeeds only for `Acknowledged`.
    ///
    /// # Errors
    ///
    /// [`ContractError::Protocol`] for unexpected data, and
    /// [`ContractError::ConnectionClosed`] for `ConnectionClosed`.
    pub fn into_ack(self) -> Result<(), ContractError> {
        match self {
            Self::Acknowledged => Ok(()),
            Self::Result(_) => Err(ContractError::Protocol(
                "unexpected reply to fire-and-forget operation".into(),
            )),
            Self::ConnectionClosed => Err(ContractError::ConnectionClosed),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationOutcome<U> {
        match self {
            Self::Acknowledged => OperationOutcome::Acknowledged,
            Self::Result(data) => OperationOutcome::Result(f(data)),
            Self::ConnectionClosed => OperationOutcome::ConnectionClosed,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

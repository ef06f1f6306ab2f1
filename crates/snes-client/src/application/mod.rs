//! Application layer of the client.
//!
//! - **`contract`** – The [`contract::OperationContract`] trait every
//!   transport implements, including the polling watch helpers.
//! - **`selector`** – [`selector::TransportSelector`], which picks the active
//!   implementation at runtime and enforces connection-state gating in one
//!   place.

pub mod contract;
pub mod selector;

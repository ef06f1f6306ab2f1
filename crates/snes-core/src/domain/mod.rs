//! Domain entities for SNES-Link.
//!
//! Pure logic with no I/O: address maps, the CMD-space assembler, device
//! metadata, the connection state machine, and tagged operation outcomes.

pub mod address;
pub mod device;
pub mod outcome;
pub mod state;

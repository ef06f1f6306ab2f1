//! Protocol module containing the usb2snes envelope and the hardware codec.

pub mod ips;
pub mod listing;
pub mod packet;
pub mod wire;

pub use packet::{DeviceCommand, DeviceOpcode, DeviceSpace, PacketError, ResponseHeader};
pub use wire::{
    check_transfer_len, hex_operand, memory_transfer_len, parse_hex, Opcode, ReplyShape, Space,
    WireError, WireReply, WireRequest, MAX_FILE_TRANSFER, MAX_MEMORY_TRANSFER,
};

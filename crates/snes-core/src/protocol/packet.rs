//! Fixed 512-byte command packets understood by the SD2SNES/FXPak firmware.
//!
//! Command layout:
//! ```text
//! [0..4]     magic "USBA"
//! [4]        opcode
//! [5]        address space
//! [6]        flags
//! [8..252]   path (NUL-terminated)            LS, MKDIR, RM, MV, BOOT, file GET/PUT
//! [32..72]   up to 8 x (size:u8, address:u32) VGET, VPUT
//! [252..256] size (big-endian u32)            GET, PUT
//! [256..260] address (big-endian u32)         memory GET, PUT
//! [256..512] second path (NUL-terminated)     MV
//! ```
//!
//! Response layout: magic, opcode `RESPONSE`, byte 5 = error flag, byte 6 =
//! feature bitmap (INFO only), size at 252.  INFO additionally carries the
//! running ROM name at 16, a version word at 256 and the firmware string at 260.
//!
//! Data phases that follow a command or response are padded to whole blocks
//! of [`BLOCK_SIZE`] bytes, or [`SMALL_BLOCK_SIZE`] when `DATA64B` is set.

use thiserror::Error;

use crate::domain::device::DeviceInfo;
use crate::protocol::wire::Space;

pub const PACKET_SIZE: usize = 512;
pub const MAGIC: [u8; 4] = *b"USBA";
pub const BLOCK_SIZE: usize = 512;
pub const SMALL_BLOCK_SIZE: usize = 64;
/// Maximum number of `(size, address)` pairs in one VGET/VPUT packet.
pub const MAX_VECTOR_PAIRS: usize = 8;

const OFFSET_OPCODE: usize = 4;
const OFFSET_SPACE: usize = 5;
const OFFSET_FLAGS: usize = 6;
const OFFSET_PATH: usize = 8;
const OFFSET_VECTOR: usize = 32;
const OFFSET_SIZE: usize = 252;
const OFFSET_ADDRESS: usize = 256;
const OFFSET_PATH2: usize = 256;
const OFFSET_ROM_NAME: usize = 16;
const OFFSET_VERSION: usize = 256;
const OFFSET_FIRMWARE: usize = 260;

/// Longest path that fits between byte 8 and the size field, leaving a NUL.
pub const MAX_PATH_LEN: usize = OFFSET_SIZE - OFFSET_PATH - 1;

/// Packet flag bits (byte 6 of a command).
pub mod flags {
    pub const NONE: u8 = 0;
    pub const SKIPRESET: u8 = 1;
    pub const ONLYRESET: u8 = 2;
    pub const CLRX: u8 = 4;
    pub const SETX: u8 = 8;
    pub const STREAM_BURST: u8 = 16;
    pub const NORESP: u8 = 64;
    pub const DATA64B: u8 = 128;
}

/// Feature bits reported in byte 6 of an INFO response, in bit order.
pub const FEATURE_NAMES: [&str; 8] = [
    "FEAT_DSPX",
    "FEAT_ST0010",
    "FEAT_SRTC",
    "FEAT_MSU1",
    "FEAT_213F",
    "FEAT_CMD_UNLOCK",
    "FEAT_USB1",
    "FEAT_DMA1",
];

/// Errors produced while encoding or decoding hardware packets.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: need {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("bad magic: {0:02X?}")]
    BadMagic([u8; 4]),

    #[error("unknown device opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("unknown device space: 0x{0:02X}")]
    UnknownSpace(u8),

    #[error("path longer than {max} bytes: {path}")]
    PathTooLong { path: String, max: usize },

    #[error("vector command needs 1..={max} pairs, got {count}")]
    BadVectorLength { count: usize, max: usize },

    #[error("expected a RESPONSE packet, got opcode 0x{0:02X}")]
    NotAResponse(u8),
}

// ── Opcode / space enums ──────────────────────────────────────────────────────

/// Command opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeviceOpcode {
    Get = 0,
    Put = 1,
    VGet = 2,
    VPut = 3,
    Ls = 4,
    Mkdir = 5,
    Rm = 6,
    Mv = 7,
    Reset = 8,
    Boot = 9,
    PowerCycle = 10,
    Info = 11,
    MenuReset = 12,
    Stream = 13,
    Time = 14,
    Response = 15,
}

impl TryFrom<u8> for DeviceOpcode {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Get,
            1 => Self::Put,
            2 => Self::VGet,
            3 => Self::VPut,
            4 => Self::Ls,
            5 => Self::Mkdir,
            6 => Self::Rm,
            7 => Self::Mv,
            8 => Self::Reset,
            9 => Self::Boot,
            10 => Self::PowerCycle,
            11 => Self::Info,
            12 => Self::MenuReset,
            13 => Self::Stream,
            14 => Self::Time,
            15 => Self::Response,
            other => return Err(PacketError::UnknownOpcode(other)),
        })
    }
}

/// Address-space byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceSpace {
    File = 0,
    Snes = 1,
    Msu = 2,
    Cmd = 3,
    Config = 4,
}

impl TryFrom<u8> for DeviceSpace {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::File,
            1 => Self::Snes,
            2 => Self::Msu,
            3 => Self::Cmd,
            4 => Self::Config,
            other => return Err(PacketError::UnknownSpace(other)),
        })
    }
}

impl From<Space> for DeviceSpace {
    fn from(space: Space) -> Self {
        match space {
            Space::File => DeviceSpace::File,
            Space::Snes => DeviceSpace::Snes,
            Space::Msu => DeviceSpace::Msu,
            Space::Cmd => DeviceSpace::Cmd,
            Space::Config => DeviceSpace::Config,
        }
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// One decoded command packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Get { space: DeviceSpace, address: u32, size: u32 },
    Put { space: DeviceSpace, address: u32, size: u32 },
    /// `(address, size)` pairs, each size at most 255.
    VGet { space: DeviceSpace, regions: Vec<(u32, u8)> },
    VPut { space: DeviceSpace, regions: Vec<(u32, u8)> },
    GetFile { path: String },
    PutFile { path: String, size: u32 },
    List { path: String },
    MakeDir { path: String },
    Remove { path: String },
    Rename { from: String, to: String },
    Boot { path: String },
    Reset,
    MenuReset,
    PowerCycle,
    Info,
    Stream,
}

impl DeviceCommand {
    pub fn opcode(&self) -> DeviceOpcode {
        match self {
            Self::Get { .. } | Self::GetFile { .. } => DeviceOpcode::Get,
            Self::Put { .. } | Self::PutFile { .. } => DeviceOpcode::Put,
            Self::VGet { .. } => DeviceOpcode::VGet,
            Self::VPut { .. } => DeviceOpcode::VPut,
            Self::List { .. } => DeviceOpcode::Ls,
            Self::MakeDir { .. } => DeviceOpcode::Mkdir,
            Self::Remove { .. } => DeviceOpcode::Rm,
            Self::Rename { .. } => DeviceOpcode::Mv,
            Self::Boot { .. } => DeviceOpcode::Boot,
            Self::Reset => DeviceOpcode::Reset,
            Self::MenuReset => DeviceOpcode::MenuReset,
            Self::PowerCycle => DeviceOpcode::PowerCycle,
            Self::Info => DeviceOpcode::Info,
            Self::Stream => DeviceOpcode::Stream,
        }
    }

    pub fn space(&self) -> DeviceSpace {
        match self {
            Self::Get { space, .. }
            | Self::Put { space, .. }
            | Self::VGet { space, .. }
            | Self::VPut { space, .. } => *space,
            Self::Info | Self::Stream => DeviceSpace::Snes,
            _ => DeviceSpace::File,
        }
    }

    pub fn flags(&self) -> u8 {
        match self {
            Self::VGet { .. } | Self::VPut { .. } => flags::DATA64B,
            Self::Boot { .. } | Self::Reset | Self::MenuReset | Self::PowerCycle => flags::NORESP,
            _ => flags::NONE,
        }
    }

    /// Whether the device answers this command with a RESPONSE packet.
    pub fn expects_response(&self) -> bool {
        self.flags() & flags::NORESP == 0
    }

    /// Block size used for the data phase of this command.
    pub fn block_size(&self) -> usize {
        if self.flags() & flags::DATA64B != 0 {
            SMALL_BLOCK_SIZE
        } else {
            BLOCK_SIZE
        }
    }

    /// Number of payload bytes the host sends after this command.
    pub fn outbound_len(&self) -> usize {
        match self {
            Self::Put { size, .. } | Self::PutFile { size, .. } => *size as usize,
            Self::VPut { regions, .. } => regions.iter().map(|&(_, s)| s as usize).sum(),
            _ => 0,
        }
    }

    /// Encodes the command into a 512-byte packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PathTooLong`] or [`PacketError::BadVectorLength`]
    /// when the arguments do not fit the fixed layout.
    pub fn encode(&self) -> Result<[u8; PACKET_SIZE], PacketError> {
        let mut packet = [0u8; PACKET_SIZE];
        packet[..4].copy_from_slice(&MAGIC);
        packet[OFFSET_OPCODE] = self.opcode() as u8;
        packet[OFFSET_SPACE] = self.space() as u8;
        packet[OFFSET_FLAGS] = self.flags();

        match self {
            Self::Get { address, size, .. } | Self::Put { address, size, .. } => {
                put_u32(&mut packet, OFFSET_SIZE, *size);
                put_u32(&mut packet, OFFSET_ADDRESS, *address);
            }
            Self::VGet { regions, .. } | Self::VPut { regions, .. } => {
                if regions.is_empty() || regions.len() > MAX_VECTOR_PAIRS {
                    return Err(PacketError::BadVectorLength {
                        count: regions.len(),
                        max: MAX_VECTOR_PAIRS,
                    });
                }
                for (i, &(address, size)) in regions.iter().enumerate() {
                    let at = OFFSET_VECTOR + i * 5;
                    packet[at] = size;
                    put_u32(&mut packet, at + 1, address);
                }
            }
            Self::GetFile { path }
            | Self::List { path }
            | Self::MakeDir { path }
            | Self::Remove { path }
            | Self::Boot { path } => {
                put_path(&mut packet, OFFSET_PATH, path, MAX_PATH_LEN)?;
            }
            Self::PutFile { path, size } => {
                put_path(&mut packet, OFFSET_PATH, path, MAX_PATH_LEN)?;
                put_u32(&mut packet, OFFSET_SIZE, *size);
            }
            Self::Rename { from, to } => {
                put_path(&mut packet, OFFSET_PATH, from, MAX_PATH_LEN)?;
                put_path(&mut packet, OFFSET_PATH2, to, PACKET_SIZE - OFFSET_PATH2 - 1)?;
            }
            Self::Reset | Self::MenuReset | Self::PowerCycle | Self::Info | Self::Stream => {}
        }
        Ok(packet)
    }

    /// Decodes a 512-byte command packet.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError`] if the packet is short, has the wrong magic, or
    /// carries an unknown opcode or space.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        check_header(bytes)?;
        let opcode = DeviceOpcode::try_from(bytes[OFFSET_OPCODE])?;
        let space = DeviceSpace::try_from(bytes[OFFSET_SPACE])?;

        Ok(match opcode {
            DeviceOpcode::Get if space == DeviceSpace::File => Self::GetFile {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
            },
            DeviceOpcode::Put if space == DeviceSpace::File => Self::PutFile {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
                size: get_u32(bytes, OFFSET_SIZE),
            },
            DeviceOpcode::Get => Self::Get {
                space,
                address: get_u32(bytes, OFFSET_ADDRESS),
                size: get_u32(bytes, OFFSET_SIZE),
            },
            DeviceOpcode::Put => Self::Put {
                space,
                address: get_u32(bytes, OFFSET_ADDRESS),
                size: get_u32(bytes, OFFSET_SIZE),
            },
            DeviceOpcode::VGet | DeviceOpcode::VPut => {
                let regions = read_vector(bytes);
                if regions.is_empty() {
                    return Err(PacketError::BadVectorLength {
                        count: 0,
                        max: MAX_VECTOR_PAIRS,
                    });
                }
                if opcode == DeviceOpcode::VGet {
                    Self::VGet { space, regions }
                } else {
                    Self::VPut { space, regions }
                }
            }
            DeviceOpcode::Ls => Self::List {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
            },
            DeviceOpcode::Mkdir => Self::MakeDir {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
            },
            DeviceOpcode::Rm => Self::Remove {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
            },
            DeviceOpcode::Mv => Self::Rename {
                from: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
                to: read_cstr(bytes, OFFSET_PATH2, PACKET_SIZE),
            },
            DeviceOpcode::Boot => Self::Boot {
                path: read_cstr(bytes, OFFSET_PATH, OFFSET_SIZE),
            },
            DeviceOpcode::Reset => Self::Reset,
            DeviceOpcode::MenuReset => Self::MenuReset,
            DeviceOpcode::PowerCycle => Self::PowerCycle,
            DeviceOpcode::Info => Self::Info,
            DeviceOpcode::Stream => Self::Stream,
            DeviceOpcode::Time | DeviceOpcode::Response => {
                return Err(PacketError::UnknownOpcode(opcode as u8))
            }
        })
    }
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// Fixed part of a RESPONSE packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    /// The device rejected the command (missing path, existing directory, ...).
    pub error: bool,
    /// Byte 6: feature bitmap on INFO, otherwise the echoed flags.
    pub flags: u8,
    /// Length of the data phase that follows.
    pub size: u32,
}

impl ResponseHeader {
    pub fn ok(size: u32) -> Self {
        Self {
            error: false,
            flags: 0,
            size,
        }
    }

    pub fn failed() -> Self {
        Self {
            error: true,
            flags: 0,
            size: 0,
        }
    }

    pub fn encode(&self) -> [u8; PACKET_SIZE] {
        let mut packet = [0u8; PACKET_SIZE];
        packet[..4].copy_from_slice(&MAGIC);
        packet[OFFSET_OPCODE] = DeviceOpcode::Response as u8;
        packet[OFFSET_SPACE] = u8::from(self.error);
        packet[OFFSET_FLAGS] = self.flags;
        put_u32(&mut packet, OFFSET_SIZE, self.size);
        packet
    }

    /// Decodes a RESPONSE packet header.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::NotAResponse`] when the opcode byte is not
    /// `RESPONSE`, besides the usual length/magic checks.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        check_header(bytes)?;
        if bytes[OFFSET_OPCODE] != DeviceOpcode::Response as u8 {
            return Err(PacketError::NotAResponse(bytes[OFFSET_OPCODE]));
        }
        Ok(Self {
            error: bytes[OFFSET_SPACE] != 0,
            flags: bytes[OFFSET_FLAGS],
            size: get_u32(bytes, OFFSET_SIZE),
        })
    }
}

/// Builds the RESPONSE packet a device sends for INFO.
pub fn encode_info(rom_running: &str, version: u32, firmware: &str, features: u8) -> [u8; PACKET_SIZE] {
    let mut packet = ResponseHeader {
        error: false,
        flags: features,
        size: 0,
    }
    .encode();
    write_cstr(&mut packet, OFFSET_ROM_NAME, rom_running, OFFSET_SIZE - OFFSET_ROM_NAME - 1);
    put_u32(&mut packet, OFFSET_VERSION, version);
    write_cstr(&mut packet, OFFSET_FIRMWARE, firmware, PACKET_SIZE - OFFSET_FIRMWARE - 1);
    packet
}

/// Extracts device information from an INFO RESPONSE packet.
///
/// # Errors
///
/// Returns [`PacketError`] if `bytes` is not a valid RESPONSE packet.
pub fn decode_info(bytes: &[u8]) -> Result<DeviceInfo, PacketError> {
    let header = ResponseHeader::decode(bytes)?;
    let version = get_u32(bytes, OFFSET_VERSION);
    let features = FEATURE_NAMES
        .iter()
        .enumerate()
        .filter(|(bit, _)| header.flags & (1 << bit) != 0)
        .map(|(_, name)| (*name).to_string())
        .collect();

    Ok(DeviceInfo {
        firmware_version: read_cstr(bytes, OFFSET_FIRMWARE, PACKET_SIZE),
        version_string: if version == 0 {
            String::new()
        } else {
            format!("{version:X}")
        },
        rom_running: read_cstr(bytes, OFFSET_ROM_NAME, OFFSET_SIZE),
        features,
    })
}

// ── Block helpers ─────────────────────────────────────────────────────────────

/// Length of a data phase of `size` bytes once padded to whole blocks.
pub fn padded_len(size: usize, block: usize) -> usize {
    size.div_ceil(block) * block
}

/// Copies `data` into a buffer padded with zeros to whole blocks.
pub fn pad_to_blocks(data: &[u8], block: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    out.resize(padded_len(data.len(), block), 0);
    out
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn check_header(bytes: &[u8]) -> Result<(), PacketError> {
    if bytes.len() < PACKET_SIZE {
        return Err(PacketError::InsufficientData {
            needed: PACKET_SIZE,
            available: bytes.len(),
        });
    }
    let magic = [bytes[0], bytes[1], bytes[2], bytes[3]];
    if magic != MAGIC {
        return Err(PacketError::BadMagic(magic));
    }
    Ok(())
}

fn put_u32(packet: &mut [u8], at: usize, value: u32) {
    packet[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

fn get_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn put_path(packet: &mut [u8], at: usize, path: &str, max: usize) -> Result<(), PacketError> {
    if path.len() > max {
        return Err(PacketError::PathTooLong {
            path: path.to_string(),
            max,
        });
    }
    packet[at..at + path.len()].copy_from_slice(path.as_bytes());
    Ok(())
}

fn write_cstr(packet: &mut [u8], at: usize, text: &str, max: usize) {
    let bytes = text.as_bytes();
    let len = bytes.len().min(max);
    packet[at..at + len].copy_from_slice(&bytes[..len]);
}

fn read_cstr(bytes: &[u8], start: usize, end: usize) -> String {
    let field = &bytes[start..end];
    let len = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..len]).into_owned()
}

fn read_vector(bytes: &[u8]) -> Vec<(u32, u8)> {
    (0..MAX_VECTOR_PAIRS)
        .map(|i| OFFSET_VECTOR + i * 5)
        .map(|at| (get_u32(bytes, at + 1), bytes[at]))
        .take_while(|&(_, size)| size != 0)
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

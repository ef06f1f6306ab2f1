//! Console address map and the CMD-space write path.
//!
//! Callers always use the external ("usb2snes") numbering:
//!
//! | Region    | External range        | Console bus        |
//! |-----------|-----------------------|--------------------|
//! | ROM       | `0x000000..0xE00000`  | cartridge ROM      |
//! | SRAM      | `0xE00000..0xF00000`  | cartridge SRAM     |
//! | WRAM      | `0xF50000..0xF70000`  | `0x7E0000..0x800000` |
//!
//! WRAM on SD2SNES-class devices cannot be poked directly.  Writes there are
//! turned into a short 65816 program that the firmware runs from its CMD
//! window at `0x2C00`: the program loads each byte as an immediate and stores
//! it to the bank-`7E` address, then clears the trigger byte and returns
//! through the NMI vector.

use thiserror::Error;

use crate::protocol::wire::hex_operand;

pub const ROM_START: u32 = 0x000000;
pub const SRAM_START: u32 = 0xE00000;
pub const WRAM_START: u32 = 0xF50000;
pub const WRAM_SIZE: u32 = 0x20000;
/// Console bus address of the first WRAM byte.
pub const WRAM_BANK_BASE: u32 = 0x7E0000;

pub const CMD_SPACE_ADDRESS: u32 = 0x2C00;
pub const CMD_SPACE_SIZE: usize = 0x400;

const PROLOGUE: [u8; 6] = [0x00, 0xE2, 0x20, 0x48, 0xEB, 0x48];
const EPILOGUE: [u8; 14] = [
    0xA9, 0x00, 0x8F, 0x00, 0x2C, 0x00, 0x68, 0xEB, 0x68, 0x28, 0x6C, 0xEA, 0xFF, 0x08,
];
const BYTES_PER_STORE: usize = 6;
/// Most bytes one program can store while fitting the CMD window.
pub const MAX_BYTES_PER_PROGRAM: usize =
    (CMD_SPACE_SIZE - PROLOGUE.len() - EPILOGUE.len()) / BYTES_PER_STORE;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("write of {len} bytes at 0x{address:06X} leaves WRAM (0xF50000..0xF70000)")]
    OutsideWram { address: u32, len: usize },

    #[error("unsupported 65816 opcode 0x{opcode:02X} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: usize },

    #[error("program ends inside an instruction at offset {0}")]
    Truncated(usize),
}

/// Returns `true` when `[address, address + len)` lies inside WRAM.
pub fn is_wram(address: u32, len: usize) -> bool {
    let end = address as u64 + len as u64;
    address >= WRAM_START && end <= (WRAM_START + WRAM_SIZE) as u64
}

/// Maps an external WRAM address onto the console bus.
pub fn wram_to_bus(address: u32) -> Option<u32> {
    is_wram(address, 1).then(|| address - WRAM_START + WRAM_BANK_BASE)
}

/// Maps a console bus WRAM address (banks `7E`/`7F`) to the external numbering.
pub fn bus_to_wram(bus: u32) -> Option<u32> {
    (WRAM_BANK_BASE..WRAM_BANK_BASE + WRAM_SIZE)
        .contains(&bus)
        .then(|| bus - WRAM_BANK_BASE + WRAM_START)
}

/// Whether a device name reported by `DeviceList` belongs to an SD2SNES-class
/// device that needs the CMD-space write path.
pub fn is_sd2snes_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("SD2SNES") || (upper.len() == 4 && upper.starts_with("COM"))
}

// ── Assembler ─────────────────────────────────────────────────────────────────

/// One program for the CMD window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdProgram {
    pub code: Vec<u8>,
}

impl CmdProgram {
    /// `PutAddress` operands: the body at `2C00`, then the trigger byte at `2C00`.
    ///
    /// The final code byte (`PHP`) lands on the placeholder at offset 0 last,
    /// which is what starts execution.
    pub fn operands(&self) -> Vec<String> {
        vec![
            hex_operand(CMD_SPACE_ADDRESS),
            hex_operand(self.code.len() as u32 - 1),
            hex_operand(CMD_SPACE_ADDRESS),
            hex_operand(1),
        ]
    }
}

/// Assembles WRAM writes into as few CMD programs as fit the window.
///
/// # Errors
///
/// Returns [`AddressError::OutsideWram`] if any write leaves WRAM.
pub fn assemble_wram_writes(writes: &[(u32, Vec<u8>)]) -> Result<Vec<CmdProgram>, AddressError> {
    let mut stores = Vec::new();
    for (address, data) in writes {
        if !is_wram(*address, data.len()) {
            return Err(AddressError::OutsideWram {
                address: *address,
                len: data.len(),
            });
        }
        for (i, &byte) in data.iter().enumerate() {
            stores.push((*address + i as u32 - WRAM_START + WRAM_BANK_BASE, byte));
        }
    }

    Ok(stores
        .chunks(MAX_BYTES_PER_PROGRAM)
        .map(|chunk| {
            let mut code = Vec::with_capacity(PROLOGUE.len() + chunk.len() * 6 + EPILOGUE.len());
            code.extend_from_slice(&PROLOGUE);
            for &(bus, byte) in chunk {
                let [_, hi, mid, lo] = bus.to_be_bytes();
                code.extend_from_slice(&[0xA9, byte, 0x8F, lo, mid, hi]);
            }
            code.extend_from_slice(&EPILOGUE);
            CmdProgram { code }
        })
        .collect())
}

/// Runs a CMD program far enough to recover the stores it performs.
///
/// Only the straight-line subset emitted by [`assemble_wram_writes`] is
/// understood.  Returns `(bus address, byte)` pairs in execution order.
///
/// # Errors
///
/// Returns [`AddressError`] for opcodes outside that subset.
pub fn interpret_cmd_program(code: &[u8]) -> Result<Vec<(u32, u8)>, AddressError> {
    let mut stores = Vec::new();
    let mut a: u16 = 0;
    let mut p: u8 = 0;
    let mut stack: Vec<u8> = Vec::new();
    let mut pc = 0;

    while pc < code.len() {
        let opcode = code[pc];
        let m8 = p & 0x20 != 0;
        let step = match opcode {
            // Trigger placeholder before the PHP byte lands on it.
            0x00 => 1,
            0x08 => {
                stack.push(p);
                1
            }
            0x28 => {
                p = stack.pop().unwrap_or(0);
                1
            }
            0xE2 => {
                p |= operand(code, pc, 1)?[0];
                2
            }
            0xC2 => {
                p &= !operand(code, pc, 1)?[0];
                2
            }
            0x48 => {
                let [hi, lo] = a.to_be_bytes();
                if !m8 {
                    stack.push(hi);
                }
                stack.push(lo);
                1
            }
            0x68 => {
                let lo = stack.pop().unwrap_or(0);
                a = if m8 {
                    (a & 0xFF00) | lo as u16
                } else {
                    u16::from_be_bytes([stack.pop().unwrap_or(0), lo])
                };
                1
            }
            0xEB => {
                a = a.rotate_left(8);
                1
            }
            0xEA => 1,
            0xA9 if m8 => {
                a = (a & 0xFF00) | operand(code, pc, 1)?[0] as u16;
                2
            }
            0xA9 => {
                let imm = operand(code, pc, 2)?;
                a = u16::from_le_bytes([imm[0], imm[1]]);
                3
            }
            0x8F => {
                let addr = operand(code, pc, 3)?;
                let bus = u32::from_le_bytes([addr[0], addr[1], addr[2], 0]);
                let [hi, lo] = a.to_be_bytes();
                stores.push((bus, lo));
                if !m8 {
                    stores.push((bus + 1, hi));
                }
                4
            }
            // JMP (abs), RTS, RTL, RTI hand control back to the game.
            0x6C | 0x60 | 0x6B | 0x40 => break,
            other => {
                return Err(AddressError::UnsupportedOpcode {
                    opcode: other,
                    offset: pc,
                })
            }
        };
        pc += step;
    }
    Ok(stores)
}

fn operand(code: &[u8], pc: usize, len: usize) -> Result<&[u8], AddressError> {
    code.get(pc + 1..pc + 1 + len).ok_or(AddressError::Truncated(pc))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wram_translation_uses_fixed_offset() {
        assert_eq!(wram_to_bus(0xF50000), Some(0x7E0000));
        assert_eq!(wram_to_bus(0xF6FFFF), Some(0x7FFFFF));
        assert_eq!(wram_to_bus(0xF70000), None);
        assert_eq!(bus_to_wram(0x7E0010), Some(0xF50010));
        assert_eq!(bus_to_wram(0x002C00), None);
    }

    #[test]
    fn test_is_wram_checks_the_whole_range() {
        assert!(is_wram(0xF50000, 0x20000));
        assert!(!is_wram(0xF6FFFF, 2));
        assert!(!is_wram(0xE00000, 1));
    }

    #[test]
    fn test_sd2snes_names() {
        assert!(is_sd2snes_name("SD2SNES COM3"));
        assert!(is_sd2snes_name("sd2snes /dev/ttyACM0"));
        assert!(is_sd2snes_name("COM4"));
        assert!(!is_sd2snes_name("COM10-emulator"));
        assert!(!is_sd2snes_name("RetroArch Localhost"));
    }

    #[test]
    fn test_single_byte_program_layout() {
        // Arrange / Act
        let programs = assemble_wram_writes(&[(0xF50010, vec![0x42])]).unwrap();

        // Assert
        assert_eq!(programs.len(), 1);
        assert_eq!(
            programs[0].code,
            vec![
                0x00, 0xE2, 0x20, 0x48, 0xEB, 0x48, // prologue
                0xA9, 0x42, 0x8F, 0x10, 0x00, 0x7E, // LDA #$42 ; STA $7E0010
                0xA9, 0x00, 0x8F, 0x00, 0x2C, 0x00, 0x68, 0xEB, 0x68, 0x28, 0x6C, 0xEA, 0xFF, 0x08,
            ]
        );
        assert_eq!(programs[0].operands(), vec!["2c00", "19", "2c00", "1"]);
    }

    #[test]
    fn test_writes_outside_wram_are_rejected() {
        let err = assemble_wram_writes(&[(0xE00000, vec![1])]).unwrap_err();
        assert_eq!(err, AddressError::OutsideWram { address: 0xE00000, len: 1 });
    }

    #[test]
    fn test_large_writes_split_to_fit_cmd_window() {
        let data = vec![0xAB; MAX_BYTES_PER_PROGRAM * 2 + 1];
        let programs = assemble_wram_writes(&[(0xF51000, data)]).unwrap();
        assert_eq!(programs.len(), 3);
        assert!(programs.iter().all(|p| p.code.len() <= CMD_SPACE_SIZE));
    }

    #[test]
    fn test_interpreter_recovers_assembled_stores() {
        // Arrange: the device sees the body first, then PHP lands on offset 0.
        let programs = assemble_wram_writes(&[(0xF50100, vec![1, 2, 3])]).unwrap();
        let mut loaded = programs[0].code.clone();
        loaded[0] = *loaded.last().unwrap();
        loaded.pop();

        // Act
        let stores = interpret_cmd_program(&loaded).unwrap();

        // Assert: three data stores, then the trigger clear at $002C00
        assert_eq!(
            stores,
            vec![(0x7E0100, 1), (0x7E0101, 2), (0x7E0102, 3), (0x002C00, 0)]
        );
    }

    #[test]
    fn test_interpreter_rejects_unknown_opcodes() {
        assert_eq!(
            interpret_cmd_program(&[0x08, 0x22, 0x00, 0x80, 0x00]),
            Err(AddressError::UnsupportedOpcode { opcode: 0x22, offset: 1 })
        );
    }
}

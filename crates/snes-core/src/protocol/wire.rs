//! The usb2snes JSON envelope.
//!
//! Requests travel as a text frame:
//! ```text
//! {"Opcode":"GetAddress","Space":"SNES","Flags":[],"Operands":["f50010","2"]}
//! ```
//! Replies, when an opcode has one, are `{"Results":[...]}` text frames and/or
//! binary frames.  Numeric operands are lower-case hexadecimal without a
//! `0x` prefix.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Errors raised while building or parsing envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid JSON envelope: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid hex operand: {0:?}")]
    BadHex(String),

    #[error("address operands must come in pairs, got {0}")]
    OddOperands(usize),

    #[error("{opcode:?} is missing operand {index}")]
    MissingOperand { opcode: Opcode, index: usize },

    #[error("transfer of {declared} bytes exceeds the {limit}-byte limit")]
    TransferTooLarge { declared: u64, limit: usize },
}

/// Most bytes one memory request may move: the whole 24-bit bus.
pub const MAX_MEMORY_TRANSFER: usize = 16 * 1024 * 1024;

/// Most bytes one file transfer may move.
pub const MAX_FILE_TRANSFER: usize = 1024 * 1024 * 1024;

/// Request opcodes understood by usb2snes-compatible servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Opcode {
    DeviceList,
    Attach,
    AppVersion,
    Name,
    Info,
    Boot,
    Menu,
    Reset,
    Stream,
    Fence,
    GetAddress,
    PutAddress,
    #[serde(rename = "PutIPS")]
    PutIps,
    GetFile,
    PutFile,
    List,
    Remove,
    Rename,
    MakeDir,
    Shutdown,
}

/// What the server sends back for an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Fire-and-forget: no frame at all.
    None,
    /// One `{"Results": [...]}` text frame.
    Results,
    /// Binary frames totalling the byte count the requester asked for.
    Binary,
    /// `Results[0]` holds a hex size, then binary frames of that many bytes.
    SizedBinary,
}

impl Opcode {
    /// Shape of the reply a conforming server emits on success.
    pub fn reply_shape(self) -> ReplyShape {
        match self {
            Opcode::DeviceList | Opcode::AppVersion | Opcode::Info | Opcode::List => {
                ReplyShape::Results
            }
            Opcode::GetAddress => ReplyShape::Binary,
            Opcode::GetFile => ReplyShape::SizedBinary,
            _ => ReplyShape::None,
        }
    }

    /// Opcodes whose request is followed by binary payload frames.
    pub fn carries_payload(self) -> bool {
        matches!(self, Opcode::PutAddress | Opcode::PutFile | Opcode::PutIps)
    }

    /// Opcodes that need an attached device on the server side.
    pub fn is_device_scoped(self) -> bool {
        !matches!(
            self,
            Opcode::DeviceList
                | Opcode::Attach
                | Opcode::AppVersion
                | Opcode::Name
                | Opcode::Fence
                | Opcode::Shutdown
        )
    }
}

/// Address space selector carried in the `Space` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Space {
    File,
    #[default]
    Snes,
    Msu,
    Cmd,
    Config,
}

/// One request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRequest {
    #[serde(rename = "Opcode")]
    pub opcode: Opcode,
    #[serde(rename = "Space", default)]
    pub space: Space,
    #[serde(
        rename = "Flags",
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub flags: Vec<String>,
    #[serde(rename = "Operands", default, deserialize_with = "null_as_empty")]
    pub operands: Vec<String>,
}

/// One `{"Results": [...]}` reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReply {
    #[serde(rename = "Results", default, deserialize_with = "null_as_empty")]
    pub results: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

impl WireRequest {
    /// Creates a request in the default `SNES` space with no operands.
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            space: Space::Snes,
            flags: Vec::new(),
            operands: Vec::new(),
        }
    }

    pub fn with_space(mut self, space: Space) -> Self {
        self.space = space;
        self
    }

    pub fn with_operands<I, S>(mut self, operands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.operands = operands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// Builds a request whose operands are `address, size` hex pairs.
    pub fn with_address_pairs(mut self, pairs: &[(u32, u32)]) -> Self {
        self.operands = pairs
            .iter()
            .flat_map(|&(addr, size)| [hex_operand(addr), hex_operand(size)])
            .collect();
        self
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Returns operand `index` or a [`WireError::MissingOperand`].
    pub fn operand(&self, index: usize) -> Result<&str, WireError> {
        self.operands
            .get(index)
            .map(String::as_str)
            .ok_or(WireError::MissingOperand {
                opcode: self.opcode,
                index,
            })
    }

    /// Parses the operands as `(address, size)` hex pairs.
    pub fn address_pairs(&self) -> Result<Vec<(u32, u32)>, WireError> {
        if self.operands.len() % 2 != 0 {
            return Err(WireError::OddOperands(self.operands.len()));
        }
        self.operands
            .chunks_exact(2)
            .map(|pair| Ok((parse_hex(&pair[0])?, parse_hex(&pair[1])?)))
            .collect()
    }
}

impl WireReply {
    pub fn new<I, S>(results: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            results: results.into_iter().map(Into::into).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, WireError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Checks a declared transfer size against `limit`.
pub fn check_transfer_len(declared: u64, limit: usize) -> Result<usize, WireError> {
    usize::try_from(declared)
        .ok()
        .filter(|&len| len <= limit)
        .ok_or(WireError::TransferTooLarge { declared, limit })
}

/// Total size of `(address, size)` pairs, capped at [`MAX_MEMORY_TRANSFER`].
pub fn memory_transfer_len(pairs: &[(u32, u32)]) -> Result<usize, WireError> {
    let declared = pairs
        .iter()
        .try_fold(0u64, |total, &(_, size)| total.checked_add(u64::from(size)))
        .unwrap_or(u64::MAX);
    check_transfer_len(declared, MAX_MEMORY_TRANSFER)
}

/// Formats a number the way usb2snes operands expect: lower-case hex, no prefix.
pub fn hex_operand(value: u32) -> String {
    format!("{value:x}")
}

/// Parses a hex operand, tolerating an optional `0x` prefix and either case.
pub fn parse_hex(text: &str) -> Result<u32, WireError> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|_| WireError::BadHex(text.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_with_capitalised_keys() {
        let req = WireRequest::new(Opcode::GetAddress).with_address_pairs(&[(0xF50010, 2)]);
        let json = req.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"Opcode":"GetAddress","Space":"SNES","Operands":["f50010","2"]}"#
        );
    }

    #[test]
    fn test_request_accepts_null_flags_from_existing_clients() {
        let json = r#"{"Opcode":"Attach","Space":"SNES","Flags":null,"Operands":["SD2SNES COM3"]}"#;
        let req = WireRequest::from_json(json).unwrap();
        assert_eq!(req.opcode, Opcode::Attach);
        assert!(req.flags.is_empty());
        assert_eq!(req.operand(0).unwrap(), "SD2SNES COM3");
    }

    #[test]
    fn test_put_ips_uses_upper_case_wire_name() {
        let req = WireRequest::new(Opcode::PutIps).with_operands(["hook", "1a"]);
        assert!(req.to_json().unwrap().contains(r#""Opcode":"PutIPS""#));
        let back = WireRequest::from_json(&req.to_json().unwrap()).unwrap();
        assert_eq!(back.opcode, Opcode::PutIps);
    }

    #[test]
    fn test_missing_space_defaults_to_snes() {
        let req = WireRequest::from_json(r#"{"Opcode":"DeviceList"}"#).unwrap();
        assert_eq!(req.space, Space::Snes);
        assert!(req.operands.is_empty());
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        assert!(WireRequest::from_json(r#"{"Opcode":"Teleport","Space":"SNES"}"#).is_err());
    }

    #[test]
    fn test_address_pairs_parse_in_order() {
        let req = WireRequest::new(Opcode::GetAddress)
            .with_address_pairs(&[(0xF50000, 0x10), (0xE00000, 0x200)]);
        assert_eq!(
            req.address_pairs().unwrap(),
            vec![(0xF50000, 0x10), (0xE00000, 0x200)]
        );
    }

    #[test]
    fn test_address_pairs_rejects_odd_operand_count() {
        let req = WireRequest::new(Opcode::GetAddress).with_operands(["f50000"]);
        assert!(matches!(req.address_pairs(), Err(WireError::OddOperands(1))));
    }

    #[test]
    fn test_memory_transfer_len_sums_pairs() {
        assert_eq!(memory_transfer_len(&[(0, 0x10), (0x100, 0x200)]).unwrap(), 0x210);
        assert_eq!(memory_transfer_len(&[]).unwrap(), 0);
    }

    #[test]
    fn test_memory_transfer_len_rejects_oversized_totals() {
        // Arrange: thousands of maximal sizes, far past the bus
        let pairs: Vec<(u32, u32)> = (0..4000).map(|i| (i, u32::MAX)).collect();

        // Act
        let result = memory_transfer_len(&pairs);

        // Assert
        assert!(matches!(
            result,
            Err(WireError::TransferTooLarge { limit: MAX_MEMORY_TRANSFER, .. })
        ));
    }

    #[test]
    fn test_check_transfer_len_accepts_the_limit_itself() {
        assert_eq!(check_transfer_len(16, 16).unwrap(), 16);
        assert!(check_transfer_len(17, 16).is_err());
    }

    #[test]
    fn test_parse_hex_accepts_prefix_and_upper_case() {
        assert_eq!(parse_hex("0x2C00").unwrap(), 0x2C00);
        assert_eq!(parse_hex("FE1000").unwrap(), 0xFE1000);
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_reply_shapes_match_usb2snes_behaviour() {
        assert_eq!(Opcode::MakeDir.reply_shape(), ReplyShape::None);
        assert_eq!(Opcode::PutAddress.reply_shape(), ReplyShape::None);
        assert_eq!(Opcode::List.reply_shape(), ReplyShape::Results);
        assert_eq!(Opcode::GetAddress.reply_shape(), ReplyShape::Binary);
        assert_eq!(Opcode::GetFile.reply_shape(), ReplyShape::SizedBinary);
    }

    #[test]
    fn test_reply_round_trip_and_null_results() {
        let reply = WireReply::new(["1.11.0", "0", "/sd2snes/menu.bin"]);
        let back = WireReply::from_json(&reply.to_json().unwrap()).unwrap();
        assert_eq!(back, reply);
        assert!(WireReply::from_json(r#"{"Results":null}"#)
            .unwrap()
            .results
            .is_empty());
    }
}

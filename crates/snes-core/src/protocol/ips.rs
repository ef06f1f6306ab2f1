//! IPS patch decoding for `PutIPS`.
//!
//! Format: `"PATCH"`, then records of `offset:u24 BE, size:u16 BE, data`,
//! where `size == 0` introduces an RLE record `count:u16 BE, value:u8`,
//! terminated by `"EOF"`.

use thiserror::Error;

const HEADER: &[u8] = b"PATCH";
const FOOTER: &[u8] = b"EOF";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IpsError {
    #[error("missing PATCH header")]
    MissingHeader,

    #[error("patch truncated at offset {0}")]
    Truncated(usize),
}

/// One write produced by a patch record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsRecord {
    pub offset: u32,
    pub data: Vec<u8>,
}

/// Decodes an IPS patch into its records, expanding RLE runs.
///
/// # Errors
///
/// Returns [`IpsError`] if the header is missing or a record is cut short.
pub fn decode_ips(patch: &[u8]) -> Result<Vec<IpsRecord>, IpsError> {
    if !patch.starts_with(HEADER) {
        return Err(IpsError::MissingHeader);
    }
    let mut pos = HEADER.len();
    let mut records = Vec::new();

    loop {
        if patch[pos..].starts_with(FOOTER) && patch.len() - pos <= FOOTER.len() + 3 {
            return Ok(records);
        }
        let header = patch.get(pos..pos + 5).ok_or(IpsError::Truncated(pos))?;
        let offset = u32::from_be_bytes([0, header[0], header[1], header[2]]);
        let size = u16::from_be_bytes([header[3], header[4]]) as usize;
        pos += 5;

        let data = if size == 0 {
            let rle = patch.get(pos..pos + 3).ok_or(IpsError::Truncated(pos))?;
            pos += 3;
            let count = u16::from_be_bytes([rle[0], rle[1]]) as usize;
            vec![rle[2]; count]
        } else {
            let body = patch.get(pos..pos + size).ok_or(IpsError::Truncated(pos))?;
            pos += size;
            body.to_vec()
        };
        records.push(IpsRecord { offset, data });
    }
}

/// Encodes records as an IPS patch.
pub fn encode_ips(records: &[IpsRecord]) -> Vec<u8> {
    let mut out = HEADER.to_vec();
    for record in records {
        out.extend_from_slice(&record.offset.to_be_bytes()[1..]);
        out.extend_from_slice(&(record.data.len() as u16).to_be_bytes());
        out.extend_from_slice(&record.data);
    }
    out.extend_from_slice(FOOTER);
    out
}

// ── Tests ─────────────────────────────────────────────────────────────────────

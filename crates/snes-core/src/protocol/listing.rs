//! Directory listing records.
//!
//! On the device side a listing is a stream of `(type, name\0)` records packed
//! into 512-byte blocks.  A `0x02` type byte means "the rest of this block is
//! padding, continue in the next one"; `0xFF` ends the listing.
//!
//! On the wire side the same listing is a flat `Results` array of
//! `[type, name, type, name, ...]` strings.

use thiserror::Error;

use crate::domain::device::{DirEntry, EntryKind};
use crate::protocol::packet::BLOCK_SIZE;

pub const END_OF_LISTING: u8 = 0xFF;
pub const CONTINUED: u8 = 0x02;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ListingError {
    #[error("unknown entry type byte 0x{0:02X} at offset {1}")]
    UnknownType(u8, usize),

    #[error("listing results must come in pairs, got {0}")]
    OddResults(usize),

    #[error("unknown entry type {0:?} in listing results")]
    UnknownResultType(String),
}

/// Records decoded so far and whether the end sentinel was seen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListingProgress {
    pub entries: Vec<DirEntry>,
    pub complete: bool,
}

/// Packs `entries` into whole blocks terminated by [`END_OF_LISTING`].
pub fn encode_listing(entries: &[DirEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOCK_SIZE);
    for entry in entries {
        let record_len = 1 + entry.name.len() + 1;
        let used = out.len() % BLOCK_SIZE;
        // A record never straddles a block; the terminator needs one spare byte.
        if used + record_len + 1 > BLOCK_SIZE {
            out.push(CONTINUED);
            out.resize(out.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
        }
        out.push(entry.kind as u8);
        out.extend_from_slice(entry.name.as_bytes());
        out.push(0);
    }
    out.push(END_OF_LISTING);
    out.resize(out.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE, 0);
    out
}

/// Decodes as many records as `data` holds.
///
/// `data` is the concatenation of the blocks read so far; callers keep
/// reading blocks until [`ListingProgress::complete`] is `true`.
///
/// # Errors
///
/// Returns [`ListingError::UnknownType`] for a type byte outside the known set.
pub fn decode_listing(data: &[u8]) -> Result<ListingProgress, ListingError> {
    let mut progress = ListingProgress::default();
    let mut pos = 0;

    while pos < data.len() {
        match data[pos] {
            END_OF_LISTING => {
                progress.complete = true;
                return Ok(progress);
            }
            CONTINUED => {
                pos = (pos / BLOCK_SIZE + 1) * BLOCK_SIZE;
            }
            type_byte @ (0 | 1) => {
                let name_start = pos + 1;
                let Some(len) = data[name_start..].iter().position(|&b| b == 0) else {
                    return Ok(progress);
                };
                let name = String::from_utf8_lossy(&data[name_start..name_start + len]).into_owned();
                let kind = if type_byte == 0 {
                    EntryKind::Directory
                } else {
                    EntryKind::File
                };
                progress.entries.push(DirEntry { kind, name });
                pos = name_start + len + 1;
            }
            other => return Err(ListingError::UnknownType(other, pos)),
        }
    }
    Ok(progress)
}

/// Flattens entries into the wire `Results` shape.
pub fn entries_to_results(entries: &[DirEntry]) -> Vec<String> {
    entries
        .iter()
        .flat_map(|e| [(e.kind as u8).to_string(), e.name.clone()])
        .collect()
}

/// Parses a wire `Results` listing, dropping the `.` and `..` entries.
///
/// # Errors
///
/// Returns [`ListingError`] if the array is not `type, name` pairs.
pub fn results_to_entries(results: &[String]) -> Result<Vec<DirEntry>, ListingError> {
    if results.len() % 2 != 0 {
        return Err(ListingError::OddResults(results.len()));
    }
    results
        .chunks_exact(2)
        .filter(|pair| pair[1] != "." && pair[1] != "..")
        .map(|pair| {
            let kind = match pair[0].as_str() {
                "0" => EntryKind::Directory,
                "1" => EntryKind::File,
                other => return Err(ListingError::UnknownResultType(other.to_string())),
            };
            Ok(DirEntry {
                kind,
                name: pair[1].clone(),
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

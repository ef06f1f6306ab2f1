//! Device handler: the 512-byte packet protocol over a byte link.
//!
//! A [`DeviceHandler`] owns one [`DeviceLink`] (a serial port or the
//! in-memory simulator) and turns high-level requests into command packets,
//! RESPONSE packets, and block-padded data phases.
//!
//! # Exchange shape (for beginners)
//!
//! ```text
//! host ── command (512 bytes) ──────────────▶ device
//! host ◀─────────── RESPONSE (512 bytes) ──── device   (unless NORESP)
//! host ◀──────────▶ data phase, padded to 512 or 64-byte blocks
//! ```
//!
//! Reads of many small regions use `VGET` (up to eight regions of at most
//! 255 bytes, 64-byte blocks); anything larger falls back to one `GET` per
//! region.  Writes mirror that with `VPUT`/`PUT`.

pub mod discovery;
pub mod serial;
pub mod simulated;

use async_trait::async_trait;
use snes_core::protocol::listing::{decode_listing, ListingError};
use snes_core::protocol::packet::{
    decode_info, pad_to_blocks, padded_len, DeviceCommand, DeviceSpace, PacketError, ResponseHeader,
    BLOCK_SIZE, MAX_VECTOR_PAIRS, PACKET_SIZE, SMALL_BLOCK_SIZE,
};
use snes_core::{DeviceInfo, DirEntry};
use thiserror::Error;
use tracing::trace;

use crate::domain::identity::DeviceIdentity;

pub use discovery::{DeviceConnector, HardwareConnector};
pub use serial::SerialLink;
pub use simulated::{SimulatedConnector, SimulatedDevice, SimulatedLink};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("malformed packet: {0}")]
    Packet(#[from] PacketError),

    #[error("malformed directory listing: {0}")]
    Listing(#[from] ListingError),

    #[error("device rejected {0}")]
    Rejected(String),

    #[error("device did not answer in time")]
    Timeout,

    #[error("device link is closed")]
    Closed,

    #[error("no device named {0:?}")]
    NotFound(String),
}

/// Raw byte pipe to a device.
#[async_trait]
pub trait DeviceLink: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError>;

    /// Fills `buf` completely or fails.
    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;
}

/// One batched transfer in a read or write plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Transfer {
    Vector(Vec<(u32, u8)>),
    Single { address: u32, size: u32 },
}

/// Groups regions into `VGET`/`VPUT` vectors where they fit, keeping order.
pub(crate) fn plan_transfers(regions: &[(u32, u32)]) -> Vec<Transfer> {
    let mut plan = Vec::new();
    let mut vector: Vec<(u32, u8)> = Vec::new();

    for &(address, size) in regions.iter().filter(|&&(_, size)| size > 0) {
        match u8::try_from(size) {
            Ok(small) => {
                vector.push((address, small));
                if vector.len() == MAX_VECTOR_PAIRS {
                    plan.push(Transfer::Vector(std::mem::take(&mut vector)));
                }
            }
            Err(_) => {
                if !vector.is_empty() {
                    plan.push(Transfer::Vector(std::mem::take(&mut vector)));
                }
                plan.push(Transfer::Single { address, size });
            }
        }
    }
    if !vector.is_empty() {
        plan.push(Transfer::Vector(vector));
    }
    plan
}

pub struct DeviceHandler {
    identity: DeviceIdentity,
    link: Box<dyn DeviceLink>,
}

impl DeviceHandler {
    pub fn new(identity: DeviceIdentity, link: Box<dyn DeviceLink>) -> Self {
        Self { identity, link }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    // ── Packet plumbing ───────────────────────────────────────────────────────

    /// Sends `command` and, unless it is `NORESP`, reads its RESPONSE packet.
    async fn command(&mut self, command: &DeviceCommand) -> Result<Option<[u8; PACKET_SIZE]>, DeviceError> {
        trace!("{}: -> {:?}", self.identity, command.opcode());
        self.link.write_all(&command.encode()?).await?;
        if !command.expects_response() {
            return Ok(None);
        }

        let mut response = [0u8; PACKET_SIZE];
        self.link.read_exact(&mut response).await?;
        if ResponseHeader::decode(&response)?.error {
            return Err(DeviceError::Rejected(describe(command)));
        }
        Ok(Some(response))
    }

    /// Like [`Self::command`] for commands that always answer.
    async fn request(&mut self, command: &DeviceCommand) -> Result<ResponseHeader, DeviceError> {
        match self.command(command).await? {
            Some(response) => Ok(ResponseHeader::decode(&response)?),
            None => Ok(ResponseHeader::default()),
        }
    }

    async fn read_data(&mut self, len: usize, block: usize) -> Result<Vec<u8>, DeviceError> {
        let mut data = vec![0u8; padded_len(len, block)];
        self.link.read_exact(&mut data).await?;
        data.truncate(len);
        Ok(data)
    }

    async fn write_data(&mut self, data: &[u8], block: usize) -> Result<(), DeviceError> {
        if data.is_empty() {
            return Ok(());
        }
        self.link.write_all(&pad_to_blocks(data, block)).await
    }

    // ── Operations ────────────────────────────────────────────────────────────

    pub async fn info(&mut self) -> Result<DeviceInfo, DeviceError> {
        match self.command(&DeviceCommand::Info).await? {
            Some(response) => Ok(decode_info(&response)?),
            None => Err(DeviceError::Closed),
        }
    }

    /// Reads `regions` in order and returns their bytes concatenated.
    pub async fn read_regions(&mut self, space: DeviceSpace, regions: &[(u32, u32)]) -> Result<Vec<u8>, DeviceError> {
        let mut out = Vec::new();

        for transfer in plan_transfers(regions) {
            match transfer {
                Transfer::Vector(regions) => {
                    let len = regions.iter().map(|&(_, size)| size as usize).sum();
                    self.request(&DeviceCommand::VGet { space, regions }).await?;
                    out.extend(self.read_data(len, SMALL_BLOCK_SIZE).await?);
                }
                Transfer::Single { address, size } => {
                    self.request(&DeviceCommand::Get { space, address, size }).await?;
                    out.extend(self.read_data(size as usize, BLOCK_SIZE).await?);
                }
            }
        }
        Ok(out)
    }

    /// Writes `data` across `regions` in order; `data` holds their sizes summed.
    pub async fn write_regions(
        &mut self,
        space: DeviceSpace,
        regions: &[(u32, u32)],
        data: &[u8],
    ) -> Result<(), DeviceError> {
        let mut offset = 0;
        for transfer in plan_transfers(regions) {
            match transfer {
                Transfer::Vector(regions) => {
                    let len: usize = regions.iter().map(|&(_, size)| size as usize).sum();
                    self.request(&DeviceCommand::VPut { space, regions }).await?;
                    self.write_data(&data[offset..offset + len], SMALL_BLOCK_SIZE).await?;
                    offset += len;
                }
                Transfer::Single { address, size } => {
                    let len = size as usize;
                    self.request(&DeviceCommand::Put { space, address, size }).await?;
                    self.write_data(&data[offset..offset + len], BLOCK_SIZE).await?;
                    offset += len;
                }
            }
        }
        Ok(())
    }

    /// Lists `path`, reading blocks until the end-of-listing marker.
    pub async fn list(&mut self, path: &str) -> Result<Vec<DirEntry>, DeviceError> {
        self.request(&DeviceCommand::List { path: path.to_string() }).await?;
        let mut blocks = Vec::new();
        loop {
            blocks.extend(self.read_data(BLOCK_SIZE, BLOCK_SIZE).await?);
            let progress = decode_listing(&blocks)?;
            if progress.complete {
                return Ok(progress.entries);
            }
        }
    }

    pub async fn make_dir(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(&DeviceCommand::MakeDir { path: path.to_string() }).await?;
        Ok(())
    }

    pub async fn remove(&mut self, path: &str) -> Result<(), DeviceError> {
        self.request(&DeviceCommand::Remove { path: path.to_string() }).await?;
        Ok(())
    }

    pub async fn rename(&mut self, from: &str, to: &str) -> Result<(), DeviceError> {
        let command = DeviceCommand::Rename {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.request(&command).await?;
        Ok(())
    }

    pub async fn boot(&mut self, path: &str) -> Result<(), DeviceError> {
        self.command(&DeviceCommand::Boot { path: path.to_string() }).await?;
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), DeviceError> {
        self.command(&DeviceCommand::Reset).await?;
        Ok(())
    }

    pub async fn menu(&mut self) -> Result<(), DeviceError> {
        self.command(&DeviceCommand::MenuReset).await?;
        Ok(())
    }

    pub async fn get_file(&mut self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let header = self.request(&DeviceCommand::GetFile { path: path.to_string() }).await?;
        self.read_data(header.size as usize, BLOCK_SIZE).await
    }

    pub async fn put_file(&mut self, path: &str, data: &[u8]) -> Result<(), DeviceError> {
        let size = u32::try_from(data.len())
            .map_err(|_| DeviceError::Rejected(format!("PUT {path}: {} bytes is too large", data.len())))?;
        self.request(&DeviceCommand::PutFile {
            path: path.to_string(),
            size,
        })
        .await?;
        self.write_data(data, BLOCK_SIZE).await
    }
}

fn describe(command: &DeviceCommand) -> String {
    match command {
        DeviceCommand::GetFile { path }
        | DeviceCommand::PutFile { path, .. }
        | DeviceCommand::List { path }
        | DeviceCommand::MakeDir { path }
        | DeviceCommand::Remove { path }
        | DeviceCommand::Boot { path } => format!("{:?} {path}", command.opcode()),
        DeviceCommand::Rename { from, to } => format!("MV {from} -> {to}"),
        other => format!("{:?}", other.opcode()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! Per-session request dispatch.
//!
//! [`Session::dispatch`] maps one decoded request (plus its binary payload,
//! if the opcode carries one) onto the attached device handler and returns
//! what should go back to the client.  Anything that fails on the device
//! side is returned as an error, which makes the session loop close the
//! connection: that is the only failure signal usb2snes clients understand.

use std::sync::Arc;

use snes_core::protocol::ips::{decode_ips, IpsError};
use snes_core::protocol::listing::entries_to_results;
use snes_core::protocol::packet::DeviceSpace;
use snes_core::protocol::{
    check_transfer_len, memory_transfer_len, parse_hex, WireError, MAX_FILE_TRANSFER, MAX_MEMORY_TRANSFER,
};
use snes_core::{OperationOutcome, Opcode, WireRequest};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::infrastructure::device::{DeviceError, DeviceHandler};
use crate::infrastructure::pool::{DeviceLease, DevicePool};

/// Version string answered to `AppVersion`.
pub const APP_VERSION: &str = concat!("snes-server-", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed request: {0}")]
    Wire(#[from] WireError),

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("bad IPS patch: {0}")]
    Ips(#[from] IpsError),

    #[error("{0:?} needs an attached device")]
    NotAttached(Opcode),

    #[error("{0:?} is not supported")]
    Unsupported(Opcode),

    #[error("expected {expected} payload bytes, received {received}")]
    PayloadOverflow { expected: usize, received: usize },

    #[error("text frame arrived while a binary payload was expected")]
    UnexpectedText,

    #[error("binary frame arrived while a request was expected")]
    UnexpectedBinary,

    #[error("client closed the connection mid-request")]
    PeerClosed,
}

/// What a request produces on success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Results(Vec<String>),
    /// Raw bytes split into binary frames.
    Binary(Vec<u8>),
    /// A hex size in `Results[0]`, then the bytes as binary frames.
    SizedBinary(Vec<u8>),
}

pub struct Session {
    id: Uuid,
    pool: Arc<DevicePool>,
    client_name: Option<String>,
    lease: Option<DeviceLease>,
}

impl Session {
    pub fn new(id: Uuid, pool: Arc<DevicePool>) -> Self {
        Self {
            id,
            pool,
            client_name: None,
            lease: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn attached_device(&self) -> Option<String> {
        self.lease.as_ref().map(DeviceLease::name)
    }

    /// Binary payload bytes that follow `request`.
    ///
    /// # Errors
    ///
    /// [`SessionError::Wire`] when the size operands are missing, not hex, or
    /// declare more than one request may move.
    pub fn payload_len(request: &WireRequest) -> Result<usize, SessionError> {
        Ok(match request.opcode {
            Opcode::PutAddress => memory_transfer_len(&request.address_pairs()?)?,
            Opcode::PutFile => {
                check_transfer_len(u64::from(parse_hex(request.operand(1)?)?), MAX_FILE_TRANSFER)?
            }
            Opcode::PutIps => {
                check_transfer_len(u64::from(parse_hex(request.operand(1)?)?), MAX_MEMORY_TRANSFER)?
            }
            _ => 0,
        })
    }

    /// Executes one request.
    ///
    /// `ConnectionClosed` means the session should end without an error
    /// (a failed `Attach`).
    ///
    /// # Errors
    ///
    /// Any [`SessionError`]; the caller closes the session.
    pub async fn dispatch(
        &mut self,
        request: &WireRequest,
        payload: Vec<u8>,
    ) -> Result<OperationOutcome<Reply>, SessionError> {
        match request.opcode {
            Opcode::DeviceList => {
                let names = match self.pool.device_names().await {
                    Ok(names) => names,
                    Err(e) => {
                        warn!("session {}: {e}", self.id);
                        Vec::new()
                    }
                };
                return Ok(OperationOutcome::Result(Reply::Results(names)));
            }
            Opcode::Attach => return Ok(self.attach(request.operand(0)?).await),
            Opcode::AppVersion => {
                return Ok(OperationOutcome::Result(Reply::Results(vec![APP_VERSION.to_string()])))
            }
            Opcode::Name => {
                let name = request.operand(0)?.to_string();
                debug!("session {} is {name:?}", self.id);
                self.client_name = Some(name);
                return Ok(OperationOutcome::Acknowledged);
            }
            Opcode::Fence => return Ok(OperationOutcome::Acknowledged),
            Opcode::Stream | Opcode::Shutdown => return Err(SessionError::Unsupported(request.opcode)),
            _ => {}
        }

        let lease = self.lease.as_ref().ok_or(SessionError::NotAttached(request.opcode))?;
        let mut handler = lease.handler().lock().await;
        device_request(&mut handler, request, payload).await
    }

    async fn attach(&mut self, name: &str) -> OperationOutcome<Reply> {
        // Re-attaching releases the previous device first.
        self.lease = None;
        match self.pool.acquire(name).await {
            Ok(lease) => {
                info!("session {} attached to {}", self.id, lease.identity());
                self.lease = Some(lease);
                OperationOutcome::Acknowledged
            }
            Err(e) => {
                warn!("session {}: attach failed: {e}", self.id);
                OperationOutcome::ConnectionClosed
            }
        }
    }
}

async fn device_request(
    handler: &mut DeviceHandler,
    request: &WireRequest,
    payload: Vec<u8>,
) -> Result<OperationOutcome<Reply>, SessionError> {
    let space = DeviceSpace::from(request.space);
    let reply = match request.opcode {
        Opcode::Info => Reply::Results(handler.info().await?.to_results()),
        Opcode::GetAddress => {
            let regions = request.address_pairs()?;
            memory_transfer_len(&regions)?;
            Reply::Binary(handler.read_regions(space, &regions).await?)
        }
        Opcode::GetFile => Reply::SizedBinary(handler.get_file(request.operand(0)?).await?),
        Opcode::List => Reply::Results(entries_to_results(&handler.list(request.operand(0)?).await?)),
        Opcode::PutAddress => {
            handler.write_regions(space, &request.address_pairs()?, &payload).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::PutIps => {
            for record in decode_ips(&payload)? {
                let region = (record.offset, record.data.len() as u32);
                handler.write_regions(space, &[region], &record.data).await?;
            }
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::PutFile => {
            handler.put_file(request.operand(0)?, &payload).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::MakeDir => {
            handler.make_dir(request.operand(0)?).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::Remove => {
            handler.remove(request.operand(0)?).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::Rename => {
            handler.rename(request.operand(0)?, request.operand(1)?).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::Boot => {
            handler.boot(request.operand(0)?).await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::Menu => {
            handler.menu().await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        Opcode::Reset => {
            handler.reset().await?;
            return Ok(OperationOutcome::Acknowledged);
        }
        other => return Err(SessionError::Unsupported(other)),
    };
    Ok(OperationOutcome::Result(reply))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! File transfers and directory handling.
//!
//! Two device quirks shape this module.  `MakeDir` on an existing directory
//! and `List` on a missing path both make the server drop the connection
//! instead of answering with an error.  So every path is resolved from the
//! root one component at a time, each step listing a directory already known
//! to exist, and confirmed directories are cached until the next attach.

use snes_core::domain::device::DirEntry;
use snes_core::protocol::listing::results_to_entries;
use snes_core::protocol::{check_transfer_len, hex_operand, parse_hex, MAX_FILE_TRANSFER};
use snes_core::{retry, ContractError, Frame, Opcode, Operation, OperationOutcome, WireReply, WireRequest};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::{EngineInner, Expect, Wire};
use crate::domain::transfer::{FileTransferSession, TransferOptions, TransferReport};

/// Drops the transport if a transfer stops half way, so leftover frames
/// cannot be read as the reply to the next request.
struct TransferGuard<'a> {
    wire: &'a mut Wire,
    armed: bool,
}

impl<'a> TransferGuard<'a> {
    fn new(wire: &'a mut Wire) -> Self {
        Self { wire, armed: true }
    }

    fn wire(&mut self) -> &mut Wire {
        &mut *self.wire
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.wire.endpoint.is_some() {
            warn!("transfer interrupted; transport will be reopened");
            self.wire.transport = None;
            self.wire.needs_reconnect = true;
            self.wire.consecutive_timeouts = 0;
        }
    }
}

/// Absolute device path without a trailing slash (`/` stays `/`).
fn normalize(path: &str) -> Result<String, ContractError> {
    if !path.starts_with('/') {
        return Err(ContractError::InvalidArgument(format!(
            "device paths must be absolute: {path:?}"
        )));
    }
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(ContractError::InvalidArgument(format!(
            "relative components are not allowed: {path:?}"
        )));
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Splits a normalized non-root path into parent directory and entry name.
fn split(path: &str) -> Result<(String, String), ContractError> {
    match path.rsplit_once('/') {
        Some((_, "")) | None => Err(ContractError::InvalidArgument(format!(
            "path names no entry: {path:?}"
        ))),
        Some(("", name)) => Ok(("/".to_string(), name.to_string())),
        Some((parent, name)) => Ok((parent.to_string(), name.to_string())),
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{name}")
    } else {
        format!("{parent}/{name}")
    }
}

impl EngineInner {
    // ── Directory primitives ─────────────────────────────────────────────────

    /// Lists a directory the caller knows exists.
    async fn list_known(&self, path: &str) -> Result<Vec<DirEntry>, ContractError> {
        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::List).with_operands([path]);
        let results = self
            .exchange(&mut wire, Operation::ListDirectory, request, &[], Expect::Results)
            .await?
            .into_data()?
            .into_results()?;
        results_to_entries(&results).map_err(|e| ContractError::Protocol(e.to_string()))
    }

    async fn find_entry(&self, parent: &str, name: &str) -> Result<Option<DirEntry>, ContractError> {
        Ok(self
            .list_known(parent)
            .await?
            .into_iter()
            .find(|entry| entry.name == name))
    }

    async fn is_known_dir(&self, path: &str) -> bool {
        path == "/" || self.wire.lock().await.known_dirs.contains(path)
    }

    async fn remember_dir(&self, path: &str) {
        self.wire.lock().await.known_dirs.insert(path.to_string());
    }

    async fn forget_dirs_under(&self, path: &str) {
        let prefix = format!("{path}/");
        self.wire
            .lock()
            .await
            .known_dirs
            .retain(|known| known != path && !known.starts_with(&prefix));
    }

    async fn send_only(&self, operation: Operation, request: WireRequest) -> Result<(), ContractError> {
        let mut wire = self.wire.lock().await;
        self.exchange(&mut wire, operation, request, &[], Expect::Nothing)
            .await?
            .into_ack()
    }

    /// Walks `path` from the root, confirming each component is a directory.
    ///
    /// With `create`, missing components are made (fire and forget) and then
    /// confirmed by listing their parent again; without it they yield
    /// [`ContractError::NotFound`].
    async fn resolve_directory(&self, path: &str, create: bool) -> Result<(), ContractError> {
        if self.is_known_dir(path).await {
            return Ok(());
        }
        let mut current = "/".to_string();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let child = join(&current, component);
            if !self.is_known_dir(&child).await {
                match self.find_entry(&current, component).await? {
                    Some(entry) if entry.is_dir() => {}
                    Some(_) => {
                        return Err(ContractError::InvalidArgument(format!(
                            "{child} is a file, not a directory"
                        )))
                    }
                    None if create => {
                        info!("creating directory {child}");
                        let request = WireRequest::new(Opcode::MakeDir).with_operands([child.as_str()]);
                        self.send_only(Operation::MakeDirectory, request).await?;
                        self.confirm_directory(&current, component, &child).await?;
                    }
                    None => return Err(ContractError::NotFound(child)),
                }
                self.remember_dir(&child).await;
            }
            current = child;
        }
        Ok(())
    }

    async fn confirm_directory(&self, parent: &str, name: &str, path: &str) -> Result<(), ContractError> {
        let policy = &self.config.directory_check;
        let found = retry(
            policy,
            move |attempt| async move {
                debug!("checking {path} exists (attempt {attempt})");
                match self.find_entry(parent, name).await? {
                    Some(entry) if entry.is_dir() => Ok(()),
                    _ => Err(ContractError::NotFound(path.to_string())),
                }
            },
            ContractError::is_transient,
        )
        .await;
        found.map_err(|e| match e {
            ContractError::NotFound(_) => ContractError::VerificationFailed {
                path: path.to_string(),
                attempts: policy.max_attempts.unwrap_or(1),
            },
            other => other,
        })
    }

    // ── Directory operations ─────────────────────────────────────────────────

    pub(crate) async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ContractError> {
        self.gate(Operation::ListDirectory)?;
        let path = normalize(path)?;
        self.resolve_directory(&path, false).await?;
        self.list_known(&path).await
    }

    pub(crate) async fn make_directory(&self, path: &str) -> Result<(), ContractError> {
        self.gate(Operation::MakeDirectory)?;
        let path = normalize(path)?;
        self.resolve_directory(&path, true).await
    }

    pub(crate) async fn remove(&self, path: &str) -> Result<(), ContractError> {
        self.gate(Operation::Remove)?;
        let path = normalize(path)?;
        let (parent, name) = split(&path)?;
        self.resolve_directory(&parent, false).await?;
        if self.find_entry(&parent, &name).await?.is_none() {
            return Err(ContractError::NotFound(path));
        }
        let request = WireRequest::new(Opcode::Remove).with_operands([path.as_str()]);
        self.send_only(Operation::Remove, request).await?;
        self.forget_dirs_under(&path).await;
        Ok(())
    }

    pub(crate) async fn rename(&self, from: &str, to: &str) -> Result<(), ContractError> {
        self.gate(Operation::Rename)?;
        let from = normalize(from)?;
        let to = normalize(to)?;
        let (parent, name) = split(&from)?;
        self.resolve_directory(&parent, false).await?;
        if self.find_entry(&parent, &name).await?.is_none() {
            return Err(ContractError::NotFound(from));
        }
        let request = WireRequest::new(Opcode::Rename).with_operands([from.as_str(), to.as_str()]);
        self.send_only(Operation::Rename, request).await?;
        self.forget_dirs_under(&from).await;
        Ok(())
    }

    // ── Upload ───────────────────────────────────────────────────────────────

    /// Waits until at most `limit` bytes are queued outbound.
    ///
    /// A queue that stops draining for a whole request timeout counts as a
    /// timeout like any unanswered request.
    async fn drain(&self, wire: &mut Wire, limit: usize) -> Result<(), ContractError> {
        let mut last = usize::MAX;
        let mut stalled_since = Instant::now();
        loop {
            let buffered = match wire.transport.as_ref() {
                Some(transport) => transport.buffered_amount(),
                None => return Err(ContractError::ConnectionClosed),
            };
            if buffered <= limit {
                return Ok(());
            }
            if buffered < last {
                last = buffered;
                stalled_since = Instant::now();
            } else if stalled_since.elapsed() >= self.config.request_timeout {
                return Err(self.on_timeout(wire, Operation::UploadFile));
            }
            sleep(self.config.backpressure_poll).await;
        }
    }

    pub(crate) async fn upload(
        &self,
        data: &[u8],
        destination: &str,
        options: &TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        self.gate(Operation::UploadFile)?;
        let destination = normalize(destination)?;
        let (parent, name) = split(&destination)?;
        self.resolve_directory(&parent, self.config.preemptive_directories)
            .await?;

        let mut session = FileTransferSession::new(&destination, data.len() as u64, options);
        {
            let mut wire = self.wire.lock().await;
            self.prepare(&mut wire).await?;
            let request = WireRequest::new(Opcode::PutFile)
                .with_operands([destination.clone(), hex_operand(data.len() as u32)]);
            let text = request.to_json()?;
            debug!("-> {text}");

            let mut guard = TransferGuard::new(&mut wire);
            if !self.push(guard.wire(), Frame::Text(text)).await {
                return Err(ContractError::ConnectionClosed);
            }
            for chunk in data.chunks(self.config.chunk_size) {
                if options.is_cancelled() {
                    info!("upload of {destination} cancelled at {} bytes", session.transferred);
                    return Err(ContractError::Cancelled {
                        transferred: session.transferred,
                    });
                }
                if !self.push(guard.wire(), Frame::Binary(chunk.to_vec())).await {
                    return Err(ContractError::ConnectionClosed);
                }
                session.advance(chunk.len());
                self.drain(guard.wire(), self.config.backpressure_threshold)
                    .await?;
            }
            self.drain(guard.wire(), 0).await?;
            guard.disarm();
        }

        let verified = if self.config.verify_uploads {
            self.verify_upload(&parent, &name, &destination).await?;
            true
        } else {
            false
        };
        info!("uploaded {} bytes to {destination}", session.transferred);
        Ok(session.finish(verified))
    }

    /// Retries the listing, not the transfer: the device may still be
    /// flushing when the last chunk has left.
    async fn verify_upload(&self, parent: &str, name: &str, path: &str) -> Result<(), ContractError> {
        let policy = &self.config.verification;
        let found = retry(
            policy,
            move |attempt| async move {
                debug!("verifying {path} (attempt {attempt})");
                match self.find_entry(parent, name).await? {
                    Some(entry) if !entry.is_dir() => Ok(()),
                    _ => Err(ContractError::NotFound(path.to_string())),
                }
            },
            ContractError::is_transient,
        )
        .await;
        found.map_err(|e| match e {
            ContractError::NotFound(_) => ContractError::VerificationFailed {
                path: path.to_string(),
                attempts: policy.max_attempts.unwrap_or(1),
            },
            other => other,
        })
    }

    pub(crate) async fn upload_blocking(
        &self,
        data: &[u8],
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        let budget = options
            .timeout
            .unwrap_or_else(|| self.config.blocking_upload_timeout(data.len() as u64));
        match timeout(budget, self.upload(data, destination, &options)).await {
            Ok(result) => result,
            Err(_) => Err(ContractError::Timeout {
                operation: Operation::UploadFile,
                after: budget,
            }),
        }
    }

    // ── Download ─────────────────────────────────────────────────────────────

    pub(crate) async fn download(
        &self,
        source: &str,
        options: &TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        self.gate(Operation::DownloadFile)?;
        let source = normalize(source)?;
        let (parent, name) = split(&source)?;
        self.resolve_directory(&parent, false).await?;
        match self.find_entry(&parent, &name).await? {
            Some(entry) if !entry.is_dir() => {}
            _ => return Err(ContractError::NotFound(source)),
        }

        let mut wire = self.wire.lock().await;
        self.prepare(&mut wire).await?;
        let mut guard = TransferGuard::new(&mut wire);
        let request = WireRequest::new(Opcode::GetFile).with_operands([source.as_str()]);
        if !self.push(guard.wire(), Frame::Text(request.to_json()?)).await {
            return Err(ContractError::ConnectionClosed);
        }

        let size = match self.recv(guard.wire(), Operation::DownloadFile).await? {
            None => return Err(ContractError::ConnectionClosed),
            Some(Frame::Text(text)) => {
                let reply = WireReply::from_json(&text)?;
                let size = reply
                    .results
                    .first()
                    .ok_or_else(|| ContractError::Protocol("GetFile reply without size".into()))?;
                check_transfer_len(u64::from(parse_hex(size)?), MAX_FILE_TRANSFER)?
            }
            Some(Frame::Binary(_)) => {
                return Err(ContractError::Protocol("GetFile reply started with binary".into()))
            }
        };

        let mut session = FileTransferSession::new(&source, size as u64, options);
        let outcome = self
            .recv_binary(guard.wire(), Operation::DownloadFile, size, |n| {
                if options.is_cancelled() {
                    return Err(ContractError::Cancelled {
                        transferred: session.transferred,
                    });
                }
                session.advance(n);
                Ok(())
            })
            .await?;
        let data = match outcome {
            OperationOutcome::Result(data) => data,
            other => return other.into_data(),
        };
        guard.disarm();
        info!("downloaded {} bytes from {source}", data.len());
        Ok(data)
    }

    pub(crate) async fn download_blocking(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        let budget = options.timeout.unwrap_or(self.config.download_timeout);
        match timeout(budget, self.download(source, &options)).await {
            Ok(result) => result,
            Err(_) => Err(ContractError::Timeout {
                operation: Operation::DownloadFile,
                after: budget,
            }),
        }
    }
}

//! ProtocolEngine: the operation contract spoken over one frame transport.
//!
//! # How a request flows (for beginners)
//!
//! The usb2snes protocol has no request ids.  A reply is simply "the next
//! frame(s) the server sends", so two requests in flight at once would read
//! each other's replies.  The engine therefore keeps everything that touches
//! the wire inside a [`Wire`] struct guarded by one `tokio::sync::Mutex`:
//!
//! 1. The caller's operation is checked against the connection state.
//! 2. The wire lock is taken; overlapping callers queue here.
//! 3. Stale frames left behind by an earlier timed-out request are dropped.
//! 4. The JSON request (and any binary payload) is sent.
//! 5. The reply is awaited with a per-frame deadline.
//!
//! A single timeout is reported as [`ContractError::Timeout`] and the
//! connection is kept.  After `hang_threshold` consecutive timeouts the
//! transport is dropped and [`ContractError::TransportHung`] is returned; the
//! next operation reconnects to the same endpoint and re-attaches to the same
//! device before it runs.
//!
//! The operations themselves live in `memory.rs` (reads, writes, savestate,
//! patches) and `files.rs` (transfers and directory handling).

mod files;
mod memory;

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use snes_core::domain::address::is_sd2snes_name;
use snes_core::transport::WsConnector;
use snes_core::{
    ensure_ready, ConnectionState, Connector, ContractError, DeviceInfo, DirEntry,
    FirmwareGeneration, Frame, FrameTransport, Opcode, Operation, OperationOutcome, WireReply,
    WireRequest,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::application::contract::OperationContract;
use crate::domain::config::EngineConfig;
use crate::domain::transfer::{TransferOptions, TransferReport};

/// Reply shape the caller expects for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// Fire and forget.
    Nothing,
    /// One text frame with `Results`.
    Results,
    /// Binary frames totalling exactly this many bytes.
    Binary(usize),
}

#[derive(Debug)]
pub(crate) enum Reply {
    Results(Vec<String>),
    Data(Vec<u8>),
}

impl Reply {
    pub(crate) fn into_results(self) -> Result<Vec<String>, ContractError> {
        match self {
            Reply::Results(results) => Ok(results),
            Reply::Data(_) => Err(ContractError::Protocol("expected Results, got binary".into())),
        }
    }

    pub(crate) fn into_bytes(self) -> Result<Vec<u8>, ContractError> {
        match self {
            Reply::Data(data) => Ok(data),
            Reply::Results(_) => Err(ContractError::Protocol("expected binary, got Results".into())),
        }
    }
}

/// Everything guarded by the serialization lock.
#[derive(Default)]
pub(crate) struct Wire {
    transport: Option<Box<dyn FrameTransport>>,
    consecutive_timeouts: u32,
    /// Set when a hung transport was dropped while the session stays logically open.
    needs_reconnect: bool,
    endpoint: Option<String>,
    client_name: Option<String>,
    device: Option<String>,
    sd2snes: bool,
    generation: Option<FirmwareGeneration>,
    /// Directories confirmed to exist on the attached device.
    known_dirs: HashSet<String>,
    keepalive: Option<JoinHandle<()>>,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    connector: Arc<dyn Connector>,
    wire: Mutex<Wire>,
    state: watch::Sender<ConnectionState>,
    started: Instant,
    /// Milliseconds since `started` at the last frame received.
    last_response_ms: AtomicU64,
    reconnects: AtomicU32,
}

/// Client protocol engine; cheap to clone, clones share one connection.
#[derive(Clone)]
pub struct ProtocolEngine {
    inner: Arc<EngineInner>,
}

impl ProtocolEngine {
    pub fn new(connector: Arc<dyn Connector>, config: EngineConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(EngineInner {
                config,
                connector,
                wire: Mutex::new(Wire::default()),
                state,
                started: Instant::now(),
                last_response_ms: AtomicU64::new(0),
                reconnects: AtomicU32::new(0),
            }),
        }
    }

    /// Engine that dials `ws://` endpoints with the `USB2SNES_*` overrides applied.
    pub fn websocket() -> Self {
        Self::new(Arc::new(WsConnector), EngineConfig::from_env())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Observes connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// How many times a hung transport has been replaced.
    pub fn reconnect_count(&self) -> u32 {
        self.inner.reconnects.load(Ordering::Acquire)
    }

    /// Time since the last frame was received.
    pub fn idle_for(&self) -> Duration {
        self.inner.idle_for()
    }
}

// ── Wire plumbing ─────────────────────────────────────────────────────────────

impl EngineInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("connection state {previous:?} -> {state:?}");
        }
    }

    fn gate(&self, operation: Operation) -> Result<(), ContractError> {
        ensure_ready(operation, self.state())
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_response_ms.store(now, Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_response_ms.load(Ordering::Acquire));
        self.started.elapsed().saturating_sub(last)
    }

    async fn open(&self, endpoint: &str) -> Result<Box<dyn FrameTransport>, ContractError> {
        match timeout(self.config.request_timeout, self.connector.connect(endpoint)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ContractError::Timeout {
                operation: Operation::Connect,
                after: self.config.request_timeout,
            }),
        }
    }

    /// Tears the session down after the peer closed it.
    fn mark_closed(&self, wire: &mut Wire) {
        warn!("server closed the connection");
        if let Some(task) = wire.keepalive.take() {
            task.abort();
        }
        *wire = Wire::default();
        self.set_state(ConnectionState::Disconnected);
    }

    fn on_timeout(&self, wire: &mut Wire, operation: Operation) -> ContractError {
        wire.consecutive_timeouts += 1;
        let consecutive = wire.consecutive_timeouts;
        if consecutive >= self.config.hang_threshold {
            warn!("{consecutive} consecutive timeouts; dropping hung transport");
            wire.transport = None;
            wire.needs_reconnect = true;
            wire.consecutive_timeouts = 0;
            ContractError::TransportHung { consecutive }
        } else {
            debug!("{operation:?} timed out ({consecutive} in a row)");
            ContractError::Timeout {
                operation,
                after: self.config.request_timeout,
            }
        }
    }

    /// Replaces a dropped transport and replays the session setup.
    async fn reconnect(&self, wire: &mut Wire) -> Result<(), ContractError> {
        let endpoint = wire.endpoint.clone().ok_or(ContractError::ConnectionClosed)?;
        info!("reconnecting to {endpoint}");
        let mut transport = match self.open(&endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("reconnect to {endpoint} failed: {e}");
                self.mark_closed(wire);
                return Err(e);
            }
        };
        if let Some(name) = &wire.client_name {
            let request = WireRequest::new(Opcode::Name).with_operands([name.as_str()]);
            transport.send(Frame::Text(request.to_json()?)).await?;
        }
        if let Some(device) = &wire.device {
            let request = WireRequest::new(Opcode::Attach).with_operands([device.as_str()]);
            transport.send(Frame::Text(request.to_json()?)).await?;
        }
        wire.transport = Some(transport);
        wire.needs_reconnect = false;
        wire.consecutive_timeouts = 0;
        self.reconnects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Makes sure a transport is present and free of stale frames.
    async fn prepare(&self, wire: &mut Wire) -> Result<(), ContractError> {
        if wire.transport.is_none() {
            if !wire.needs_reconnect {
                return Err(ContractError::ConnectionClosed);
            }
            self.reconnect(wire).await?;
        }
        if let Some(transport) = wire.transport.as_mut() {
            let stale = transport.discard_pending();
            if stale > 0 {
                debug!("discarded {stale} stale frames");
            }
        }
        Ok(())
    }

    /// Sends one frame; `false` means the connection is gone.
    async fn push(&self, wire: &mut Wire, frame: Frame) -> bool {
        let Some(transport) = wire.transport.as_mut() else {
            return false;
        };
        let sent = transport.send(frame).await;
        match sent {
            Ok(()) => true,
            Err(e) => {
                debug!("send failed: {e}");
                self.mark_closed(wire);
                false
            }
        }
    }

    /// Waits for the next frame; `Ok(None)` means the peer closed.
    async fn recv(&self, wire: &mut Wire, operation: Operation) -> Result<Option<Frame>, ContractError> {
        let transport = wire.transport.as_mut().ok_or(ContractError::ConnectionClosed)?;
        let received = timeout(self.config.request_timeout, transport.recv()).await;
        match received {
            Ok(Some(frame)) => {
                wire.consecutive_timeouts = 0;
                self.touch();
                Ok(Some(frame))
            }
            Ok(None) => {
                self.mark_closed(wire);
                Ok(None)
            }
            Err(_) => Err(self.on_timeout(wire, operation)),
        }
    }

    /// Collects binary frames until `expected` bytes arrived.
    async fn recv_binary(
        &self,
        wire: &mut Wire,
        operation: Operation,
        expected: usize,
        mut on_chunk: impl FnMut(usize) -> Result<(), ContractError> + Send,
    ) -> Result<OperationOutcome<Vec<u8>>, ContractError> {
        let mut data = Vec::new();
        while data.len() < expected {
            match self.recv(wire, operation).await? {
                None => return Ok(OperationOutcome::ConnectionClosed),
                Some(Frame::Binary(chunk)) => {
                    on_chunk(chunk.len())?;
                    data.extend_from_slice(&chunk);
                }
                Some(Frame::Text(text)) => {
                    return Err(ContractError::Protocol(format!(
                        "text frame during binary reply: {text}"
                    )))
                }
            }
        }
        if data.len() != expected {
            return Err(ContractError::SizeMismatch {
                expected: expected as u64,
                actual: data.len() as u64,
            });
        }
        Ok(OperationOutcome::Result(data))
    }

    /// Sends a request with an optional payload and reads the expected reply.
    pub(crate) async fn exchange(
        &self,
        wire: &mut Wire,
        operation: Operation,
        request: WireRequest,
        payload: &[u8],
        expect: Expect,
    ) -> Result<OperationOutcome<Reply>, ContractError> {
        self.prepare(wire).await?;
        let text = request.to_json()?;
        debug!("-> {text}");
        if !self.push(wire, Frame::Text(text)).await {
            return Ok(OperationOutcome::ConnectionClosed);
        }
        for chunk in payload.chunks(self.config.chunk_size) {
            if !self.push(wire, Frame::Binary(chunk.to_vec())).await {
                return Ok(OperationOutcome::ConnectionClosed);
            }
        }

        match expect {
            Expect::Nothing => Ok(OperationOutcome::Acknowledged),
            Expect::Results => match self.recv(wire, operation).await? {
                None => Ok(OperationOutcome::ConnectionClosed),
                Some(Frame::Text(text)) => {
                    let reply = WireReply::from_json(&text)?;
                    Ok(OperationOutcome::Result(Reply::Results(reply.results)))
                }
                Some(Frame::Binary(data)) => Err(ContractError::Protocol(format!(
                    "expected Results, got {} binary bytes",
                    data.len()
                ))),
            },
            Expect::Binary(size) => Ok(self
                .recv_binary(wire, operation, size, |_| Ok(()))
                .await?
                .map(Reply::Data)),
        }
    }
}

// ── Session lifecycle ─────────────────────────────────────────────────────────

impl EngineInner {
    async fn connect(self: &Arc<Self>, endpoint: &str) -> Result<(), ContractError> {
        self.gate(Operation::Connect)?;
        let mut wire = self.wire.lock().await;
        if let Some(task) = wire.keepalive.take() {
            task.abort();
        }
        if let Some(mut old) = wire.transport.take() {
            old.close().await;
        }
        *wire = Wire::default();

        self.set_state(ConnectionState::Connecting);
        match self.open(endpoint).await {
            Ok(transport) => {
                wire.transport = Some(transport);
                wire.endpoint = Some(endpoint.to_string());
                self.touch();
                self.set_state(ConnectionState::Connected);
                wire.keepalive = self.spawn_keepalive();
                info!("connected to {endpoint}");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), ContractError> {
        let mut wire = self.wire.lock().await;
        if let Some(task) = wire.keepalive.take() {
            task.abort();
        }
        if let Some(mut transport) = wire.transport.take() {
            transport.close().await;
        }
        if let Some(endpoint) = &wire.endpoint {
            info!("disconnected from {endpoint}");
        }
        *wire = Wire::default();
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>, ContractError> {
        self.gate(Operation::ListDevices)?;
        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::DeviceList);
        self.exchange(&mut wire, Operation::ListDevices, request, &[], Expect::Results)
            .await?
            .into_data()?
            .into_results()
    }

    async fn attach(&self, device: &str) -> Result<(), ContractError> {
        self.gate(Operation::Attach)?;
        let mut wire = self.wire.lock().await;

        // Attaching to a name the server does not list would cost the connection.
        let listed = self
            .exchange(&mut wire, Operation::ListDevices, WireRequest::new(Opcode::DeviceList), &[], Expect::Results)
            .await?
            .into_data()?
            .into_results()?;
        if !listed.iter().any(|name| name == device) {
            return Err(ContractError::NotFound(device.to_string()));
        }

        let request = WireRequest::new(Opcode::Attach).with_operands([device]);
        self.exchange(&mut wire, Operation::Attach, request, &[], Expect::Nothing)
            .await?
            .into_ack()?;

        wire.device = Some(device.to_string());
        wire.sd2snes = is_sd2snes_name(device);
        wire.known_dirs.clear();

        // Attach has no reply; an Info round trip confirms the device answers.
        match self.info_locked(&mut wire).await {
            Ok(info) => {
                info!("attached to {device} (firmware {})", info.firmware_version);
                self.set_state(ConnectionState::Attached);
                Ok(())
            }
            Err(e) => {
                wire.device = None;
                wire.sd2snes = false;
                // The device is listed, so a dropped session means it could not be opened.
                match e {
                    ContractError::ConnectionClosed => Err(ContractError::DeviceBusy(device.to_string())),
                    e => Err(e),
                }
            }
        }
    }

    async fn info_locked(&self, wire: &mut Wire) -> Result<DeviceInfo, ContractError> {
        let request = WireRequest::new(Opcode::Info);
        let results = self
            .exchange(wire, Operation::Info, request, &[], Expect::Results)
            .await?
            .into_data()?
            .into_results()?;
        let info = DeviceInfo::from_results(&results);
        wire.generation = Some(info.generation());
        Ok(info)
    }

    async fn get_info(&self) -> Result<DeviceInfo, ContractError> {
        self.gate(Operation::Info)?;
        let mut wire = self.wire.lock().await;
        self.info_locked(&mut wire).await
    }

    async fn set_client_name(&self, name: &str) -> Result<(), ContractError> {
        self.gate(Operation::SetClientName)?;
        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::Name).with_operands([name]);
        self.exchange(&mut wire, Operation::SetClientName, request, &[], Expect::Nothing)
            .await?
            .into_ack()?;
        wire.client_name = Some(name.to_string());
        Ok(())
    }

    async fn app_version(&self) -> Result<String, ContractError> {
        self.gate(Operation::AppVersion)?;
        let mut wire = self.wire.lock().await;
        let request = WireRequest::new(Opcode::AppVersion);
        self.exchange(&mut wire, Operation::AppVersion, request, &[], Expect::Results)
            .await?
            .into_data()?
            .into_results()?
            .into_iter()
            .next()
            .ok_or_else(|| ContractError::Protocol("empty AppVersion reply".into()))
    }

    /// Sends a console-control request that has no reply.
    ///
    /// Servers drop a session that sends these before `Attach`, and the
    /// request itself has no reply to report that, so it is refused here.
    async fn control(&self, operation: Operation, request: WireRequest) -> Result<(), ContractError> {
        self.gate(operation)?;
        let mut wire = self.wire.lock().await;
        if wire.device.is_none() {
            return Err(ContractError::NoDeviceAttached);
        }
        self.exchange(&mut wire, operation, request, &[], Expect::Nothing)
            .await?
            .into_ack()
    }

    /// Probes the server with `AppVersion` after the connection sat idle.
    fn spawn_keepalive(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.config.keepalive_interval?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            loop {
                sleep(interval / 2).await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.idle_for() < interval {
                    continue;
                }
                // A busy lock means a request is in flight; no probe needed.
                let Ok(mut wire) = inner.wire.try_lock() else {
                    continue;
                };
                if wire.transport.is_none() && !wire.needs_reconnect {
                    break;
                }
                let request = WireRequest::new(Opcode::AppVersion);
                match inner
                    .exchange(&mut wire, Operation::AppVersion, request, &[], Expect::Results)
                    .await
                {
                    Ok(OperationOutcome::ConnectionClosed) => break,
                    Ok(_) => debug!("keepalive ok"),
                    Err(e) => warn!("keepalive probe failed: {e}"),
                }
            }
        }))
    }
}

// ── OperationContract ────────────────────────────────────────────────────────

#[async_trait]
impl OperationContract for ProtocolEngine {
    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    async fn connect(&self, endpoint: &str) -> Result<(), ContractError> {
        self.inner.connect(endpoint).await
    }

    async fn disconnect(&self) -> Result<(), ContractError> {
        self.inner.disconnect().await
    }

    async fn list_devices(&self) -> Result<Vec<String>, ContractError> {
        self.inner.list_devices().await
    }

    async fn attach(&self, device: &str) -> Result<(), ContractError> {
        self.inner.attach(device).await
    }

    async fn get_info(&self) -> Result<DeviceInfo, ContractError> {
        self.inner.get_info().await
    }

    async fn set_client_name(&self, name: &str) -> Result<(), ContractError> {
        self.inner.set_client_name(name).await
    }

    async fn app_version(&self) -> Result<String, ContractError> {
        self.inner.app_version().await
    }

    async fn boot(&self, path: &str) -> Result<(), ContractError> {
        let request = WireRequest::new(Opcode::Boot).with_operands([path]);
        self.inner.control(Operation::Boot, request).await
    }

    async fn menu(&self) -> Result<(), ContractError> {
        self.inner
            .control(Operation::Menu, WireRequest::new(Opcode::Menu))
            .await
    }

    async fn reset(&self) -> Result<(), ContractError> {
        self.inner
            .control(Operation::Reset, WireRequest::new(Opcode::Reset))
            .await
    }

    async fn read_memory_batch(&self, regions: &[(u32, u32)]) -> Result<Vec<Vec<u8>>, ContractError> {
        self.inner.read_memory_batch(regions).await
    }

    async fn write_memory(&self, writes: &[(u32, Vec<u8>)]) -> Result<(), ContractError> {
        self.inner.write_memory(writes).await
    }

    async fn upload_file_blocking(
        &self,
        source: &Path,
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        let data = tokio::fs::read(source).await?;
        self.inner.upload_blocking(&data, destination, options).await
    }

    async fn upload_bytes(
        &self,
        data: &[u8],
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        self.inner.upload(data, destination, &options).await
    }

    async fn download_file(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        self.inner.download(source, &options).await
    }

    async fn download_file_blocking(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        self.inner.download_blocking(source, options).await
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ContractError> {
        self.inner.list_directory(path).await
    }

    async fn make_directory(&self, path: &str) -> Result<(), ContractError> {
        self.inner.make_directory(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), ContractError> {
        self.inner.remove(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ContractError> {
        self.inner.rename(from, to).await
    }

    async fn apply_patch(&self, patch: &[u8]) -> Result<(), ContractError> {
        self.inner.apply_patch(patch).await
    }

    async fn save_state(&self) -> Result<Vec<u8>, ContractError> {
        self.inner.save_state().await
    }

    async fn load_state(&self, data: &[u8]) -> Result<(), ContractError> {
        self.inner.load_state(data).await
    }
}

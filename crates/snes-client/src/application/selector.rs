//! TransportSelector: picks which contract implementation serves callers.
//!
//! Implementations are registered as factories keyed by [`TransportKind`].
//! Selecting a kind with no factory fails fast with
//! [`ContractError::NotImplemented`]; switching while the active
//! implementation is connected fails with
//! [`ContractError::SwitchWhileConnected`].
//!
//! The selector is itself an [`OperationContract`].  Every delegated call
//! runs the central state check first, so implementations cannot drift on
//! which operations need which state.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use snes_core::{ensure_ready, ConnectionState, ContractError, DeviceInfo, DirEntry, Operation};
use tracing::info;

use crate::application::contract::OperationContract;
use crate::domain::transfer::{TransferOptions, TransferReport};

/// Known transport families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// usb2snes protocol over WebSocket.
    Usb2Snes,
    /// Server session running in-process, no socket.
    Embedded,
    /// SNI gRPC bridge.
    Sni,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Usb2Snes => "usb2snes",
            Self::Embedded => "embedded",
            Self::Sni => "sni",
        };
        f.write_str(name)
    }
}

pub type ContractFactory = Box<dyn Fn() -> Arc<dyn OperationContract> + Send + Sync>;

struct Active {
    kind: TransportKind,
    contract: Arc<dyn OperationContract>,
}

#[derive(Default)]
pub struct TransportSelector {
    factories: HashMap<TransportKind, ContractFactory>,
    active: RwLock<Option<Active>>,
}

impl TransportSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: TransportKind,
        factory: impl Fn() -> Arc<dyn OperationContract> + Send + Sync + 'static,
    ) {
        self.factories.insert(kind, Box::new(factory));
    }

    /// Builds and activates the implementation registered for `kind`.
    ///
    /// # Errors
    ///
    /// - [`ContractError::SwitchWhileConnected`] if the current one is connected.
    /// - [`ContractError::NotImplemented`] if nothing is registered for `kind`.
    pub fn select(&self, kind: TransportKind) -> Result<(), ContractError> {
        let mut active = self
            .active
            .write()
            .map_err(|_| ContractError::Configuration("selector lock poisoned".into()))?;

        if let Some(current) = active.as_ref() {
            let state = current.contract.state();
            if state >= ConnectionState::Connected {
                return Err(ContractError::SwitchWhileConnected(state));
            }
        }
        let factory = self
            .factories
            .get(&kind)
            .ok_or_else(|| ContractError::NotImplemented(kind.to_string()))?;

        *active = Some(Active {
            kind,
            contract: factory(),
        });
        info!("selected {kind} transport");
        Ok(())
    }

    pub fn active_kind(&self) -> Option<TransportKind> {
        self.active.read().ok()?.as_ref().map(|a| a.kind)
    }

    fn current(&self) -> Result<Arc<dyn OperationContract>, ContractError> {
        self.active
            .read()
            .map_err(|_| ContractError::Configuration("selector lock poisoned".into()))?
            .as_ref()
            .map(|a| Arc::clone(&a.contract))
            .ok_or_else(|| ContractError::Configuration("no transport selected".into()))
    }

    /// Active implementation after checking that `operation` may run.
    fn ready(&self, operation: Operation) -> Result<Arc<dyn OperationContract>, ContractError> {
        let contract = self.current()?;
        ensure_ready(operation, contract.state())?;
        Ok(contract)
    }
}

#[async_trait]
impl OperationContract for TransportSelector {
    fn state(&self) -> ConnectionState {
        self.current()
            .map(|c| c.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    async fn connect(&self, endpoint: &str) -> Result<(), ContractError> {
        self.ready(Operation::Connect)?.connect(endpoint).await
    }

    async fn disconnect(&self) -> Result<(), ContractError> {
        // Disconnect is always allowed so callers can recover from any state.
        self.current()?.disconnect().await
    }

    async fn list_devices(&self) -> Result<Vec<String>, ContractError> {
        self.ready(Operation::ListDevices)?.list_devices().await
    }

    async fn attach(&self, device: &str) -> Result<(), ContractError> {
        self.ready(Operation::Attach)?.attach(device).await
    }

    async fn get_info(&self) -> Result<DeviceInfo, ContractError> {
        self.ready(Operation::Info)?.get_info().await
    }

    async fn set_client_name(&self, name: &str) -> Result<(), ContractError> {
        self.ready(Operation::SetClientName)?.set_client_name(name).await
    }

    async fn app_version(&self) -> Result<String, ContractError> {
        self.ready(Operation::AppVersion)?.app_version().await
    }

    async fn boot(&self, path: &str) -> Result<(), ContractError> {
        self.ready(Operation::Boot)?.boot(path).await
    }

    async fn menu(&self) -> Result<(), ContractError> {
        self.ready(Operation::Menu)?.menu().await
    }

    async fn reset(&self) -> Result<(), ContractError> {
        self.ready(Operation::Reset)?.reset().await
    }

    async fn read_memory(&self, address: u32, size: u32) -> Result<Vec<u8>, ContractError> {
        self.ready(Operation::ReadMemory)?.read_memory(address, size).await
    }

    async fn read_memory_batch(&self, regions: &[(u32, u32)]) -> Result<Vec<Vec<u8>>, ContractError> {
        self.ready(Operation::ReadMemory)?.read_memory_batch(regions).await
    }

    async fn write_memory(&self, writes: &[(u32, Vec<u8>)]) -> Result<(), ContractError> {
        self.ready(Operation::WriteMemory)?.write_memory(writes).await
    }

    async fn upload_file(
        &self,
        source: &Path,
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        self.ready(Operation::UploadFile)?
            .upload_file(source, destination, options)
            .await
    }

    async fn upload_file_blocking(
        &self,
        source: &Path,
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        self.ready(Operation::UploadFile)?
            .upload_file_blocking(source, destination, options)
            .await
    }

    async fn upload_bytes(
        &self,
        data: &[u8],
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        self.ready(Operation::UploadFile)?
            .upload_bytes(data, destination, options)
            .await
    }

    async fn download_file(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        self.ready(Operation::DownloadFile)?
            .download_file(source, options)
            .await
    }

    async fn download_file_blocking(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError> {
        self.ready(Operation::DownloadFile)?
            .download_file_blocking(source, options)
            .await
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ContractError> {
        self.ready(Operation::ListDirectory)?.list_directory(path).await
    }

    async fn make_directory(&self, path: &str) -> Result<(), ContractError> {
        self.ready(Operation::MakeDirectory)?.make_directory(path).await
    }

    async fn remove(&self, path: &str) -> Result<(), ContractError> {
        self.ready(Operation::Remove)?.remove(path).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), ContractError> {
        self.ready(Operation::Rename)?.rename(from, to).await
    }

    async fn apply_patch(&self, patch: &[u8]) -> Result<(), ContractError> {
        self.ready(Operation::ApplyPatch)?.apply_patch(patch).await
    }

    async fn save_state(&self) -> Result<Vec<u8>, ContractError> {
        self.ready(Operation::SaveState)?.save_state().await
    }

    async fn load_state(&self, data: &[u8]) -> Result<(), ContractError> {
        self.ready(Operation::LoadState)?.load_state(data).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

//! The operation contract: the single interface callers program against.
//!
//! Every transport implementation (the WebSocket protocol engine, an
//! in-process embedded server, a test double) exposes the same operations
//! with the same error taxonomy, so game-integration code never branches on
//! which one is active.
//!
//! # State gating
//!
//! Each operation names the [`ConnectionState`] it needs (see
//! [`Operation::required_state`]).  Implementations call
//! [`snes_core::ensure_ready`] before touching the wire and fail with
//! [`ContractError::NotReady`] instead of sending a request the server would
//! reject.
//!
//! # Watch helpers
//!
//! [`OperationContract::watch_for_value`] and
//! [`OperationContract::watch_for_conditions`] have default implementations
//! built on `read_memory_batch`, so any implementation gets them for free.

use std::path::Path;

use async_trait::async_trait;
use snes_core::{
    ConnectionState, ContractError, DeviceInfo, DirEntry, Operation,
};
use tokio::time::{sleep, Instant};

use crate::domain::transfer::{TransferOptions, TransferReport};
use crate::domain::watch::{WatchCondition, WatchOptions, WatchTarget};

#[async_trait]
pub trait OperationContract: Send + Sync {
    /// Current lifecycle state.
    fn state(&self) -> ConnectionState;

    /// Opens a connection to `endpoint` (e.g. `ws://localhost:23074`).
    async fn connect(&self, endpoint: &str) -> Result<(), ContractError>;

    /// Closes the connection; state returns to `Disconnected`.
    async fn disconnect(&self) -> Result<(), ContractError>;

    /// Names of the devices the server can attach to.
    async fn list_devices(&self) -> Result<Vec<String>, ContractError>;

    /// Binds the session to `device`.
    ///
    /// Fails with [`ContractError::NotFound`] when the server does not list
    /// `device`, and [`ContractError::DeviceBusy`] when it lists it but cannot
    /// open it.
    async fn attach(&self, device: &str) -> Result<(), ContractError>;

    async fn get_info(&self) -> Result<DeviceInfo, ContractError>;

    /// Announces this client's name to the server.
    async fn set_client_name(&self, name: &str) -> Result<(), ContractError>;

    /// Server name and version.
    async fn app_version(&self) -> Result<String, ContractError>;

    /// Boots the ROM at `path` on the device.
    async fn boot(&self, path: &str) -> Result<(), ContractError>;

    /// Returns the device to its menu.
    ///
    /// Console control needs an attached device; without one it fails with
    /// [`ContractError::NoDeviceAttached`].
    async fn menu(&self) -> Result<(), ContractError>;

    async fn reset(&self) -> Result<(), ContractError>;

    /// Reads `size` bytes at `address` in the external address space.
    async fn read_memory(&self, address: u32, size: u32) -> Result<Vec<u8>, ContractError> {
        let mut regions = self.read_memory_batch(&[(address, size)]).await?;
        regions
            .pop()
            .ok_or_else(|| ContractError::Protocol("empty batch reply".into()))
    }

    /// Reads several regions in one request; results follow input order.
    async fn read_memory_batch(&self, regions: &[(u32, u32)]) -> Result<Vec<Vec<u8>>, ContractError>;

    /// Writes each `(address, data)` pair.
    async fn write_memory(&self, writes: &[(u32, Vec<u8>)]) -> Result<(), ContractError>;

    /// Uploads a local file to `destination` on the device.
    async fn upload_file(
        &self,
        source: &Path,
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError> {
        let data = tokio::fs::read(source).await?;
        self.upload_bytes(&data, destination, options).await
    }

    /// Like [`OperationContract::upload_file`] under an overall deadline that
    /// scales with the file size.
    async fn upload_file_blocking(
        &self,
        source: &Path,
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError>;

    /// Uploads an in-memory buffer.
    async fn upload_bytes(
        &self,
        data: &[u8],
        destination: &str,
        options: TransferOptions,
    ) -> Result<TransferReport, ContractError>;

    /// Downloads the file at `source`.
    async fn download_file(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError>;

    /// Like [`OperationContract::download_file`] under an overall deadline.
    async fn download_file_blocking(
        &self,
        source: &str,
        options: TransferOptions,
    ) -> Result<Vec<u8>, ContractError>;

    /// Lists `path`, excluding `.` and `..`.
    async fn list_directory(&self, path: &str) -> Result<Vec<DirEntry>, ContractError>;

    /// Creates `path` and any missing parents; existing directories are fine.
    async fn make_directory(&self, path: &str) -> Result<(), ContractError>;

    async fn remove(&self, path: &str) -> Result<(), ContractError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), ContractError>;

    /// Applies an IPS patch to the running game's memory.
    async fn apply_patch(&self, patch: &[u8]) -> Result<(), ContractError>;

    /// Captures the console state.
    async fn save_state(&self) -> Result<Vec<u8>, ContractError>;

    /// Restores a state captured by [`OperationContract::save_state`].
    async fn load_state(&self, data: &[u8]) -> Result<(), ContractError>;

    /// Polls one region until it matches `target`, returning the matching bytes.
    async fn watch_for_value(
        &self,
        address: u32,
        size: u32,
        target: WatchTarget,
        options: WatchOptions,
    ) -> Result<Vec<u8>, ContractError> {
        let mut values = self
            .watch_for_conditions(&[WatchCondition::new(address, size, target)], options)
            .await?;
        values
            .pop()
            .ok_or_else(|| ContractError::Protocol("empty batch reply".into()))
    }

    /// Polls until every condition matches in the same snapshot.
    ///
    /// The first check happens immediately.  Fails with
    /// [`ContractError::Timeout`] once `options.timeout` passes (unless it is
    /// zero).
    async fn watch_for_conditions(
        &self,
        conditions: &[WatchCondition],
        options: WatchOptions,
    ) -> Result<Vec<Vec<u8>>, ContractError> {
        if conditions.is_empty() {
            return Err(ContractError::InvalidArgument("no watch conditions".into()));
        }
        let regions: Vec<(u32, u32)> = conditions.iter().map(|c| (c.address, c.size)).collect();
        let deadline = (!options.timeout.is_zero()).then(|| Instant::now() + options.timeout);

        loop {
            let values = self.read_memory_batch(&regions).await?;
            let all_match = conditions
                .iter()
                .zip(&values)
                .all(|(condition, value)| condition.target.matches(value));
            if all_match {
                return Ok(values);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ContractError::Timeout {
                    operation: Operation::WatchMemory,
                    after: options.timeout,
                });
            }
            sleep(options.poll_interval).await;
        }
    }
}

//! MemoryWatcher: periodic batched reads that report what changed.
//!
//! The first poll only records a baseline.  Every later poll is compared
//! with the previous snapshot and the callback receives just the regions
//! whose bytes differ.  A failed poll is logged and polling continues; the
//! watcher ends when stopped, dropped, or the connection is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snes_core::{ConnectionState, ContractError};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::contract::OperationContract;
use crate::domain::watch::{diff_snapshots, ChangeCallback, MemoryChange};

pub struct MemoryWatcher {
    contract: Arc<dyn OperationContract>,
    regions: Vec<(u32, u32)>,
    poll_interval: Duration,
    callback: ChangeCallback,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MemoryWatcher {
    pub fn new(
        contract: Arc<dyn OperationContract>,
        regions: Vec<(u32, u32)>,
        poll_interval: Duration,
        callback: ChangeCallback,
    ) -> Self {
        Self {
            contract,
            regions,
            poll_interval,
            callback,
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }

    pub fn regions(&self) -> &[(u32, u32)] {
        &self.regions
    }

    /// Starts polling; a running watcher is left as is.
    ///
    /// Each start takes a fresh baseline.
    ///
    /// # Errors
    ///
    /// [`ContractError::InvalidArgument`] for an empty region list or a zero interval.
    pub fn start(&mut self) -> Result<(), ContractError> {
        if self.is_running() {
            return Ok(());
        }
        if self.regions.is_empty() {
            return Err(ContractError::InvalidArgument("watcher has no regions".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(ContractError::InvalidArgument("watch interval must be non-zero".into()));
        }

        self.running.store(true, Ordering::Release);
        let running = Arc::clone(&self.running);
        let contract = Arc::clone(&self.contract);
        let regions = self.regions.clone();
        let callback = Arc::clone(&self.callback);
        let period = self.poll_interval;

        self.task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous: Option<Vec<Vec<u8>>> = None;

            while running.load(Ordering::Acquire) {
                ticker.tick().await;
                if contract.state() == ConnectionState::Disconnected {
                    info!("connection closed; memory watcher stopping");
                    break;
                }
                match contract.read_memory_batch(&regions).await {
                    Ok(snapshot) => {
                        if let Some(before) = &previous {
                            let changes: Vec<MemoryChange> = diff_snapshots(&regions, before, &snapshot);
                            if !changes.is_empty() {
                                debug!("{} watched regions changed", changes.len());
                                callback(&changes);
                            }
                        }
                        previous = Some(snapshot);
                    }
                    Err(e) => warn!("memory watcher poll failed: {e}"),
                }
            }
            running.store(false, Ordering::Release);
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for MemoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Adds `create_memory_watcher` to any shared contract implementation.
pub trait WatchExt {
    /// Builds and starts a watcher over `regions`.
    ///
    /// # Errors
    ///
    /// See [`MemoryWatcher::start`].
    fn create_memory_watcher(
        &self,
        regions: Vec<(u32, u32)>,
        poll_interval: Duration,
        callback: impl Fn(&[MemoryChange]) + Send + Sync + 'static,
    ) -> Result<MemoryWatcher, ContractError>;
}

impl WatchExt for Arc<dyn OperationContract> {
    fn create_memory_watcher(
        &self,
        regions: Vec<(u32, u32)>,
        poll_interval: Duration,
        callback: impl Fn(&[MemoryChange]) + Send + Sync + 'static,
    ) -> Result<MemoryWatcher, ContractError> {
        let mut watcher = MemoryWatcher::new(Arc::clone(self), regions, poll_interval, Arc::new(callback));
        watcher.start()?;
        Ok(watcher)
    }
}

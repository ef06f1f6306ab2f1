//! Shared device handlers with reference-counted leases.
//!
//! Every session that attaches to the same physical device gets the same
//! [`DeviceHandler`], behind one async mutex, so commands from different
//! sessions never interleave on the link.  A [`DeviceLease`] keeps the
//! handler alive; when the last lease for a device is dropped the handler
//! (and with it the serial port) is closed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::spawn_blocking;
use tracing::{debug, info};

use crate::domain::identity::DeviceIdentity;
use crate::infrastructure::device::{DeviceConnector, DeviceError, DeviceHandler};

pub type SharedHandler = Arc<AsyncMutex<DeviceHandler>>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no device named {0:?}")]
    UnknownDevice(String),

    #[error("failed to open {name}: {source}")]
    Open {
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("device discovery failed: {0}")]
    Discovery(#[source] DeviceError),
}

struct PoolEntry {
    handler: SharedHandler,
    leases: usize,
}

pub struct DevicePool {
    connector: Arc<dyn DeviceConnector>,
    entries: Mutex<HashMap<DeviceIdentity, PoolEntry>>,
    /// Held while a link is being opened so two sessions never open the
    /// same port at once.
    opening: AsyncMutex<()>,
}

impl DevicePool {
    pub fn new(connector: Arc<dyn DeviceConnector>) -> Arc<Self> {
        Arc::new(Self {
            connector,
            entries: Mutex::new(HashMap::new()),
            opening: AsyncMutex::new(()),
        })
    }

    /// Names of the devices present right now.
    ///
    /// # Errors
    ///
    /// [`PoolError::Discovery`] when enumeration itself fails.
    pub async fn device_names(&self) -> Result<Vec<String>, PoolError> {
        let devices = self.discover().await?;
        Ok(devices.iter().map(DeviceIdentity::device_name).collect())
    }

    /// Leases the handler for the device called `name`, opening it if no
    /// other session holds it.
    ///
    /// Enumeration and port opening block, so both run on the blocking pool.
    ///
    /// # Errors
    ///
    /// [`PoolError::UnknownDevice`] if no present device has that name, or
    /// [`PoolError::Open`] if the link cannot be opened.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> Result<DeviceLease, PoolError> {
        let identity = self
            .discover()
            .await?
            .into_iter()
            .find(|identity| identity.device_name() == name)
            .ok_or_else(|| PoolError::UnknownDevice(name.to_string()))?;

        let _opening = self.opening.lock().await;
        if let Some(handler) = self.share(&identity) {
            return Ok(self.lease(identity, handler));
        }

        let connector = Arc::clone(&self.connector);
        let target = identity.clone();
        let link = spawn_blocking(move || connector.open(&target))
            .await
            .map_err(|e| DeviceError::Io(std::io::Error::other(e)))
            .and_then(|opened| opened)
            .map_err(|source| PoolError::Open {
                name: name.to_string(),
                source,
            })?;
        info!("{identity}: opened");

        let handler = Arc::new(AsyncMutex::new(DeviceHandler::new(identity.clone(), link)));
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).insert(
            identity.clone(),
            PoolEntry {
                handler: Arc::clone(&handler),
                leases: 1,
            },
        );
        Ok(self.lease(identity, handler))
    }

    async fn discover(&self) -> Result<Vec<DeviceIdentity>, PoolError> {
        let connector = Arc::clone(&self.connector);
        spawn_blocking(move || connector.discover())
            .await
            .map_err(|e| DeviceError::Io(std::io::Error::other(e)))
            .and_then(|found| found)
            .map_err(PoolError::Discovery)
    }

    /// Adds a lease to an already open handler.
    fn share(&self, identity: &DeviceIdentity) -> Option<SharedHandler> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = entries.get_mut(identity)?;
        entry.leases += 1;
        debug!("{identity}: shared by {} sessions", entry.leases);
        Some(Arc::clone(&entry.handler))
    }

    fn lease(self: &Arc<Self>, identity: DeviceIdentity, handler: SharedHandler) -> DeviceLease {
        DeviceLease {
            pool: Arc::clone(self),
            identity,
            handler,
        }
    }

    fn release(&self, identity: &DeviceIdentity) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(identity) {
            entry.leases = entry.leases.saturating_sub(1);
            if entry.leases == 0 {
                entries.remove(identity);
                info!("{identity}: last session detached; closed");
            }
        }
    }

    /// Devices with at least one lease.
    pub fn open_devices(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Leases held on `identity`.
    pub fn lease_count(&self, identity: &DeviceIdentity) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(identity)
            .map_or(0, |entry| entry.leases)
    }
}

/// A session's claim on a shared handler; released on drop.
pub struct DeviceLease {
    pool: Arc<DevicePool>,
    identity: DeviceIdentity,
    handler: SharedHandler,
}

impl DeviceLease {
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> String {
        self.identity.device_name()
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.pool.release(&self.identity);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

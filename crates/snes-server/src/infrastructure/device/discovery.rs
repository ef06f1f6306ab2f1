//! Finding devices and opening links to them.

use std::collections::HashSet;

use serialport::SerialPortType;
use tracing::{debug, warn};

use super::{DeviceError, DeviceLink, SerialLink};
use crate::domain::config::DeviceConfig;
use crate::domain::identity::DeviceIdentity;

/// Source of device identities and links; the pool's seam for tests.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceConnector: Send + Sync {
    /// Devices currently present.
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DeviceError>;

    /// Opens a fresh link to `identity`.
    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceLink>, DeviceError>;
}

/// USB enumeration by vendor/product id, then serial port probing.
pub struct HardwareConnector {
    vendor_id: u16,
    product_id: u16,
    candidates: Vec<String>,
}

impl HardwareConnector {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            vendor_id: config.usb_vendor_id,
            product_id: config.usb_product_id,
            candidates: config.serial_candidates.clone(),
        }
    }

    fn enumerate_usb(&self) -> Vec<DeviceIdentity> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("serial port enumeration failed: {e}");
                return Vec::new();
            }
        };
        ports
            .into_iter()
            .filter_map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) if usb.vid == self.vendor_id && usb.pid == self.product_id => {
                    Some(DeviceIdentity::Usb {
                        vendor_id: usb.vid,
                        product_id: usb.pid,
                        port: info.port_name,
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// Candidates that exist on disk, skipping ports USB already reported.
    fn probe_serial(&self, known: &HashSet<String>) -> Vec<DeviceIdentity> {
        self.candidates
            .iter()
            .filter(|path| !known.contains(*path))
            .filter(|path| cfg!(windows) || std::path::Path::new(path).exists())
            .map(|path| DeviceIdentity::SerialPort(path.clone()))
            .collect()
    }
}

impl DeviceConnector for HardwareConnector {
    fn discover(&self) -> Result<Vec<DeviceIdentity>, DeviceError> {
        let mut devices = self.enumerate_usb();
        let known: HashSet<String> = devices.iter().filter_map(|d| d.port().map(str::to_string)).collect();
        if devices.is_empty() {
            devices.extend(self.probe_serial(&known));
        }
        debug!("discovered {} devices", devices.len());
        Ok(devices)
    }

    fn open(&self, identity: &DeviceIdentity) -> Result<Box<dyn DeviceLink>, DeviceError> {
        let port = identity
            .port()
            .ok_or_else(|| DeviceError::NotFound(identity.device_name()))?;
        Ok(Box::new(SerialLink::open(port)?))
    }
}

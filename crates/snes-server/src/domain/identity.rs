//! Physical (or simulated) device identity, the sharing key of the pool.

use std::fmt;

/// Stable for as long as the device stays plugged in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceIdentity {
    /// USB device enumerated by vendor/product id, reached through `port`.
    Usb {
        vendor_id: u16,
        product_id: u16,
        port: String,
    },
    /// Virtual serial port found by probing a conventional path.
    SerialPort(String),
    /// In-memory device for tests and demos.
    Simulated(String),
}

impl DeviceIdentity {
    /// Name reported by `DeviceList` and accepted by `Attach`.
    pub fn device_name(&self) -> String {
        match self {
            Self::Usb { port, .. } | Self::SerialPort(port) => format!("SD2SNES {port}"),
            Self::Simulated(name) => name.clone(),
        }
    }

    /// Serial port path, if the device is reached through one.
    pub fn port(&self) -> Option<&str> {
        match self {
            Self::Usb { port, .. } | Self::SerialPort(port) => Some(port),
            Self::Simulated(_) => None,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Usb {
                vendor_id,
                product_id,
                port,
            } => write!(f, "usb {vendor_id:04x}:{product_id:04x} at {port}"),
            Self::SerialPort(port) => write!(f, "serial {port}"),
            Self::Simulated(name) => write!(f, "simulated {name}"),
        }
    }
}

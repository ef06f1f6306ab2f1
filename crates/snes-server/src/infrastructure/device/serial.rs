//! Serial link to a physical cartridge.
//!
//! The port is opened exclusively at 9600 8N1 (the cartridge ignores the
//! baud rate; USB CDC runs at bus speed).  `serialport` is blocking, so each
//! transfer runs on the blocking pool with the port moved in and back out.

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::task::spawn_blocking;
use tracing::debug;

use super::{DeviceError, DeviceLink};

const BAUD_RATE: u32 = 9600;
const IO_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SerialLink {
    path: String,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    /// Opens `path` for exclusive use and discards stale buffered bytes.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Serial`] if the port is missing or already open.
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        let builder = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(IO_TIMEOUT);
        let port = open_exclusive(builder)?;
        port.clear(ClearBuffer::All)?;
        debug!("opened serial port {path}");
        Ok(Self {
            path: path.to_string(),
            port: Some(port),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Runs `op` against the port on the blocking pool.
    async fn with_port<T, F>(&mut self, op: F) -> Result<T, DeviceError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn SerialPort>) -> std::io::Result<T> + Send + 'static,
    {
        let mut port = self.port.take().ok_or(DeviceError::Closed)?;
        let (port, result) = spawn_blocking(move || {
            let result = op(&mut port);
            (port, result)
        })
        .await
        .map_err(|e| DeviceError::Io(std::io::Error::other(e)))?;
        self.port = Some(port);
        result.map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut => DeviceError::Timeout,
            _ => DeviceError::Io(e),
        })
    }
}

#[cfg(unix)]
fn open_exclusive(builder: serialport::SerialPortBuilder) -> Result<Box<dyn SerialPort>, DeviceError> {
    let mut port = builder.open_native()?;
    port.set_exclusive(true)?;
    Ok(Box::new(port))
}

#[cfg(not(unix))]
fn open_exclusive(builder: serialport::SerialPortBuilder) -> Result<Box<dyn SerialPort>, DeviceError> {
    // COM ports are exclusive on open.
    Ok(builder.open()?)
}

#[async_trait]
impl DeviceLink for SerialLink {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), DeviceError> {
        let data = data.to_vec();
        self.with_port(move |port| {
            port.write_all(&data)?;
            port.flush()
        })
        .await
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let len = buf.len();
        let data = self
            .with_port(move |port| {
                let mut data = vec![0u8; len];
                port.read_exact(&mut data)?;
                Ok(data)
            })
            .await?;
        buf.copy_from_slice(&data);
        Ok(())
    }
}

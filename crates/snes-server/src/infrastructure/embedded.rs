//! In-process server sessions for the client's embedded transport.

use std::sync::Arc;

use async_trait::async_trait;
use snes_core::transport::ChannelTransport;
use snes_core::{Connector, FrameTransport, TransportError};
use tracing::debug;

use crate::infrastructure::device::SimulatedConnector;
use crate::infrastructure::pool::DevicePool;
use crate::infrastructure::session::handle_session;

/// Hands out channel transports, each served by its own session task.
///
/// The endpoint string is ignored; every connection shares `pool`.
#[derive(Clone)]
pub struct EmbeddedConnector {
    pool: Arc<DevicePool>,
}

impl EmbeddedConnector {
    pub fn new(pool: Arc<DevicePool>) -> Self {
        Self { pool }
    }

    /// An embedded server over one simulated device.
    pub fn simulated(connector: SimulatedConnector) -> Self {
        Self::new(DevicePool::new(Arc::new(connector)))
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }
}

#[async_trait]
impl Connector for EmbeddedConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
        let (client, server) = ChannelTransport::pair();
        debug!("embedded session opened for {endpoint}");
        tokio::spawn(handle_session(Box::new(server), Arc::clone(&self.pool)));
        Ok(Box::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use snes_core::{Frame, Opcode, WireReply, WireRequest};

    #[tokio::test]
    async fn test_each_connect_gets_a_live_session() {
        // Arrange
        let connector = EmbeddedConnector::simulated(SimulatedConnector::new("SD2SNES SIM", "1.11.0"));

        // Act
        let mut transport = connector.connect("embedded").await.unwrap();
        let request = WireRequest::new(Opcode::DeviceList).to_json().unwrap();
        transport.send(Frame::Text(request)).await.unwrap();

        // Assert
        let Some(Frame::Text(reply)) = transport.recv().await else {
            panic!("expected a Results frame");
        };
        assert_eq!(WireReply::from_json(&reply).unwrap().results, vec!["SD2SNES SIM"]);
    }
}

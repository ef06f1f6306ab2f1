//! Message-oriented transports that carry usb2snes frames.
//!
//! The protocol only needs two frame kinds, text and binary, delivered in
//! order.  [`FrameTransport`] captures exactly that so the client engine and
//! the server session loop run unchanged over a WebSocket
//! ([`ws::WsTransport`]) or an in-process channel ([`channel::ChannelTransport`]).

pub mod channel;
pub mod ws;

use async_trait::async_trait;
use thiserror::Error;

pub use channel::ChannelTransport;
pub use ws::{WsConnector, WsTransport};

/// One protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(String),
}

/// A bidirectional, ordered stream of [`Frame`]s.
#[async_trait]
pub trait FrameTransport: Send {
    /// Queues a frame for sending.
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError>;

    /// Waits for the next inbound frame; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Frame>;

    /// Drops inbound frames that already arrived, returning how many.
    fn discard_pending(&mut self) -> usize;

    /// Bytes accepted by [`FrameTransport::send`] but not yet handed to the peer.
    fn buffered_amount(&self) -> usize;

    /// Closes the sending side; queued frames are still delivered.
    async fn close(&mut self);
}

/// Opens transports to an endpoint such as `ws://localhost:23074`.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn FrameTransport>, TransportError>;
}

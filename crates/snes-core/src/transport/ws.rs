//! WebSocket transport built on `tokio-tungstenite`.
//!
//! Each transport splits the socket and runs two tasks: a reader that pushes
//! text/binary frames into an inbound queue, and a writer that drains an
//! outbound queue.  The writer decrements a byte counter as frames reach the
//! socket, which is what [`FrameTransport::buffered_amount`] reports for
//! backpressure.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::debug;

use super::{Connector, Frame, FrameTransport, TransportError};

pub struct WsTransport {
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    inbound: mpsc::UnboundedReceiver<Frame>,
    buffered: Arc<AtomicUsize>,
    reader: JoinHandle<()>,
}

impl WsTransport {
    /// Wraps an established WebSocket (client or server side).
    pub fn new<S>(ws_stream: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let buffered = Arc::new(AtomicUsize::new(0));

        let writer_buffered = Arc::clone(&buffered);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, WsMessage::Close(_));
                let len = msg.len();
                let sent = ws_sink.send(msg).await;
                writer_buffered.fetch_sub(len, Ordering::AcqRel);
                if let Err(e) = sent {
                    debug!("websocket write failed: {e}");
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(item) = ws_source.next().await {
                let frame = match item {
                    Ok(WsMessage::Text(text)) => Frame::Text(text),
                    Ok(WsMessage::Binary(data)) => Frame::Binary(data),
                    Ok(WsMessage::Close(_)) => break,
                    // Ping/pong are answered by tungstenite itself.
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("websocket read ended: {e}");
                        break;
                    }
                };
                if in_tx.send(frame).is_err() {
                    break;
                }
            }
        });

        Self {
            outbound: Some(out_tx),
            inbound: in_rx,
            buffered,
            reader,
        }
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let outbound = self.outbound.as_ref().ok_or(TransportError::Closed)?;
        let msg = match frame {
            Frame::Text(text) => WsMessage::Text(text),
            Frame::Binary(data) => WsMessage::Binary(data),
        };
        let len = msg.len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        outbound.send(msg).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            TransportError::Closed
        })
    }

    async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        while self.inbound.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(WsMessage::Close(None));
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        // The writer exits on its own once the outbound sender is gone.
        self.reader.abort();
    }
}

/// Dials `ws://` endpoints directly.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &str) -> Result<Box<dyn FrameTransport>, TransportError> {
        let (ws_stream, _response) =
            connect_async(endpoint)
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        debug!("websocket connected to {endpoint}");
        Ok(Box::new(WsTransport::new(ws_stream)))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_text_and_binary_frames_cross_a_real_socket() {
        // Arrange: a one-shot echo server
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut server = WsTransport::new(accept_async(stream).await.unwrap());
            while let Some(frame) = server.recv().await {
                server.send(frame).await.unwrap();
            }
        });

        // Act
        let mut client = WsConnector.connect(&format!("ws://{addr}")).await.unwrap();
        client.send(Frame::Text("{\"Opcode\":\"DeviceList\"}".into())).await.unwrap();
        client.send(Frame::Binary(vec![0, 255, 7])).await.unwrap();

        // Assert
        assert_eq!(
            client.recv().await,
            Some(Frame::Text("{\"Opcode\":\"DeviceList\"}".into()))
        );
        assert_eq!(client.recv().await, Some(Frame::Binary(vec![0, 255, 7])));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let result = WsConnector.connect("ws://127.0.0.1:1").await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}

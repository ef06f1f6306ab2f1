//! Diversion: relaying sessions to an upstream usb2snes server.
//!
//! The upstream WebSocket is dialed directly or through a SOCKS5 proxy.
//! Once both ends are up, frames are copied verbatim in both directions
//! until either side closes; the relay never parses them.

use std::time::Duration;

use snes_core::transport::WsTransport;
use snes_core::FrameTransport;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_socks::tcp::Socks5Stream;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::http::Uri;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid relay target {0:?}")]
    BadTarget(String),

    #[error("connecting to {target} timed out after {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("TCP connect to {target} failed: {source}")]
    Tcp {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("SOCKS5 proxy {proxy} failed: {source}")]
    Socks {
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("WebSocket handshake with {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("forwarding failed: {0}")]
    Forward(#[from] snes_core::TransportError),
}

/// Splits `ws://host:port/...` into host and port (default 80).
fn target_host_port(target: &str) -> Result<(String, u16), RelayError> {
    let uri: Uri = target.parse().map_err(|_| RelayError::BadTarget(target.to_string()))?;
    if uri.scheme_str() != Some("ws") {
        return Err(RelayError::BadTarget(target.to_string()));
    }
    let host = uri
        .host()
        .ok_or_else(|| RelayError::BadTarget(target.to_string()))?
        .to_string();
    Ok((host, uri.port_u16().unwrap_or(80)))
}

/// Opens a WebSocket to `target`, optionally through a SOCKS5 proxy.
///
/// # Errors
///
/// [`RelayError`] describing which hop failed; the whole dial is bounded by
/// `limit`.
pub async fn connect_upstream(
    target: &str,
    socks_proxy: Option<&str>,
    limit: Duration,
) -> Result<Box<dyn FrameTransport>, RelayError> {
    let dial = async {
        let (host, port) = target_host_port(target)?;
        match socks_proxy {
            Some(proxy) => {
                let stream = Socks5Stream::connect(proxy, (host.as_str(), port))
                    .await
                    .map_err(|source| RelayError::Socks {
                        proxy: proxy.to_string(),
                        source,
                    })?;
                debug!("reached {host}:{port} through SOCKS5 proxy {proxy}");
                handshake(target, stream).await
            }
            None => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(|source| RelayError::Tcp {
                        target: target.to_string(),
                        source,
                    })?;
                handshake(target, stream).await
            }
        }
    };

    timeout(limit, dial).await.map_err(|_| RelayError::Timeout {
        target: target.to_string(),
        after: limit,
    })?
}

async fn handshake<S>(target: &str, stream: S) -> Result<Box<dyn FrameTransport>, RelayError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (ws_stream, _response) = client_async(target, stream)
        .await
        .map_err(|source| RelayError::Handshake {
            target: target.to_string(),
            source,
        })?;
    Ok(Box::new(WsTransport::new(ws_stream)))
}

/// Copies frames both ways until one side closes, then closes the other.
///
/// # Errors
///
/// [`RelayError::Forward`] if a send fails while the other side is still open.
pub async fn relay(
    mut downstream: Box<dyn FrameTransport>,
    mut upstream: Box<dyn FrameTransport>,
) -> Result<(), RelayError> {
    let mut forwarded: u64 = 0;
    let result: Result<(), RelayError> = loop {
        tokio::select! {
            frame = downstream.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = upstream.send(frame).await {
                        break Err(e.into());
                    }
                }
                None => break Ok(()),
            },
            frame = upstream.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = downstream.send(frame).await {
                        break Err(e.into());
                    }
                }
                None => break Ok(()),
            },
        }
        forwarded += 1;
    };
    downstream.close().await;
    upstream.close().await;
    info!("relay finished after {forwarded} frames");
    result
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use snes_core::transport::ChannelTransport;
    use snes_core::Frame;

    #[test]
    fn test_target_parsing() {
        assert_eq!(
            target_host_port("ws://192.168.1.5:23074").unwrap(),
            ("192.168.1.5".to_string(), 23074)
        );
        assert_eq!(target_host_port("ws://snes.local").unwrap().1, 80);
        assert!(matches!(
            target_host_port("http://example.com"),
            Err(RelayError::BadTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_relay_copies_frames_verbatim_both_ways() {
        // Arrange
        let (mut client, downstream) = ChannelTransport::pair();
        let (upstream, mut server) = ChannelTransport::pair();
        let task = tokio::spawn(relay(Box::new(downstream), Box::new(upstream)));

        // Act
        let request = Frame::Text("{\"Opcode\":\"Info\",\"Space\":\"SNES\",\"Operands\":[]}".into());
        client.send(request.clone()).await.unwrap();
        let seen_upstream = server.recv().await;
        server.send(Frame::Binary(vec![0, 1, 2, 255])).await.unwrap();
        let seen_downstream = client.recv().await;

        // Assert
        assert_eq!(seen_upstream, Some(request));
        assert_eq!(seen_downstream, Some(Frame::Binary(vec![0, 1, 2, 255])));

        client.close().await;
        tokio_test::assert_ok!(task.await.unwrap());
        assert_eq!(server.recv().await, None);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_fast() {
        let result = connect_upstream("ws://127.0.0.1:1", None, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(RelayError::Tcp { .. })));
    }
}

//! Integration tests for the WebSocket server.
//!
//! # Purpose
//!
//! These tests start real servers on ephemeral ports, backed by the
//! simulated device, and talk to them with plain usb2snes frames over a
//! WebSocket, the way third-party tools do.  They verify:
//!
//! - Device sharing: two sessions attached to one device share a single
//!   link, which is closed once the last session leaves.
//! - Diversion: a server in divert mode relays every frame to its target
//!   unchanged.
//! - Fallback: when the target is unreachable, sessions are served locally.
//! - Port retry: a server waiting on a taken port binds once it is freed.
//! - The firmware quirk where a failed `MakeDir` ends the session.
//!
//! # Topology for the relay tests
//!
//! ```text
//! client ──ws──▶ server A (divert) ──ws──▶ server B (local) ──▶ simulated device
//! ```

use std::net::SocketAddr;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use snes_core::protocol::packet::DeviceSpace;
use snes_core::transport::WsConnector;
use snes_core::{Connector, Frame, FrameTransport, Opcode, Space, WireReply, WireRequest};
use snes_server::domain::DeviceSource;
use snes_server::infrastructure::device::SimulatedConnector;
use snes_server::infrastructure::DevicePool;
use snes_server::{Server, ServerConfig, ServerHandle, ServerMode, ServerStatus};

// ── Helpers ───────────────────────────────────────────────────────────────────

fn config(port: u16, name: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.port = port;
    config.server.port_retry_interval_ms = 50;
    config.device.source = DeviceSource::Simulated;
    config.device.simulated_name = name.to_string();
    config
}

/// Starts a server on an ephemeral port with its own simulated device.
async fn start(config: ServerConfig) -> (ServerHandle, SocketAddr, SimulatedConnector) {
    let connector = SimulatedConnector::new(config.device.simulated_name.clone(), "1.11.0");
    let server = Server::new(config, DevicePool::new(Arc::new(connector.clone())));
    let mut handle = server.start().unwrap();
    let addr = handle.listening().await.unwrap();
    (handle, addr, connector)
}

async fn connect(addr: SocketAddr) -> Box<dyn FrameTransport> {
    WsConnector.connect(&format!("ws://{addr}")).await.unwrap()
}

async fn send(transport: &mut dyn FrameTransport, request: WireRequest) {
    transport.send(Frame::Text(request.to_json().unwrap())).await.unwrap();
}

async fn recv(transport: &mut dyn FrameTransport) -> Option<Frame> {
    tokio::time::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("no frame within 5s")
}

async fn results(transport: &mut dyn FrameTransport) -> Vec<String> {
    match recv(transport).await {
        Some(Frame::Text(text)) => WireReply::from_json(&text).unwrap().results,
        other => panic!("expected a results frame, got {other:?}"),
    }
}

async fn attach(transport: &mut dyn FrameTransport, name: &str) {
    send(transport, WireRequest::new(Opcode::Attach).with_operands([name])).await;
    send(transport, WireRequest::new(Opcode::Info)).await;
    let info = results(transport).await;
    assert_eq!(info[0], "1.11.0");
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

// ── Device sharing ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_two_sessions_share_one_device_link() {
    // Arrange
    let (handle, addr, connector) = start(config(0, "SD2SNES SIM")).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;

    // Act: both attach, the first writes, the second reads it back
    attach(first.as_mut(), "SD2SNES SIM").await;
    attach(second.as_mut(), "SD2SNES SIM").await;
    send(
        first.as_mut(),
        WireRequest::new(Opcode::PutAddress)
            .with_space(Space::Snes)
            .with_address_pairs(&[(0xE00010, 4)]),
    )
    .await;
    first.send(Frame::Binary(vec![9, 8, 7, 6])).await.unwrap();
    send(first.as_mut(), WireRequest::new(Opcode::Info)).await;
    results(first.as_mut()).await;
    send(
        second.as_mut(),
        WireRequest::new(Opcode::GetAddress)
            .with_space(Space::Snes)
            .with_address_pairs(&[(0xE00010, 4)]),
    )
    .await;
    let read = recv(second.as_mut()).await;

    // Assert
    assert_eq!(read, Some(Frame::Binary(vec![9, 8, 7, 6])));
    assert_eq!(connector.opened(), 1);
    assert_eq!(connector.open_links(), 1);

    first.close().await;
    second.close().await;
    wait_until(|| connector.open_links() == 0).await;
    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn test_device_list_does_not_require_attach() {
    let (handle, addr, _connector) = start(config(0, "SD2SNES SIM")).await;
    let mut client = connect(addr).await;

    send(client.as_mut(), WireRequest::new(Opcode::DeviceList)).await;

    assert_eq!(results(client.as_mut()).await, vec!["SD2SNES SIM".to_string()]);
    handle.stop();
    handle.join().await;
}

// ── Diversion and fallback ────────────────────────────────────────────────────

#[tokio::test]
async fn test_divert_mode_relays_sessions_to_the_target() {
    // Arrange: B serves its device locally, A diverts to B
    let (handle_b, addr_b, connector_b) = start(config(0, "SD2SNES REMOTE")).await;
    let mut divert = config(0, "SD2SNES LOCAL");
    divert.relay.mode = ServerMode::Divert;
    divert.relay.target = Some(format!("ws://{addr_b}"));
    let (handle_a, addr_a, connector_a) = start(divert).await;
    let mut client = connect(addr_a).await;

    // Act
    send(client.as_mut(), WireRequest::new(Opcode::DeviceList)).await;
    let devices = results(client.as_mut()).await;
    attach(client.as_mut(), "SD2SNES REMOTE").await;
    send(
        client.as_mut(),
        WireRequest::new(Opcode::PutAddress)
            .with_space(Space::Snes)
            .with_address_pairs(&[(0xE00000, 3)]),
    )
    .await;
    client.send(Frame::Binary(vec![1, 2, 3])).await.unwrap();
    send(client.as_mut(), WireRequest::new(Opcode::Info)).await;
    results(client.as_mut()).await;

    // Assert: only B's device was seen and touched
    assert_eq!(devices, vec!["SD2SNES REMOTE".to_string()]);
    let written = connector_b
        .device()
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .peek(DeviceSpace::Snes, 0xE00000, 3);
    assert_eq!(written, vec![1, 2, 3]);
    assert_eq!(connector_a.opened(), 0);

    handle_a.stop();
    handle_b.stop();
    handle_a.join().await;
    handle_b.join().await;
}

#[tokio::test]
async fn test_fallback_serves_locally_when_the_target_is_down() {
    // Arrange
    let mut fallback = config(0, "SD2SNES LOCAL");
    fallback.relay.mode = ServerMode::Fallback;
    fallback.relay.target = Some("ws://127.0.0.1:1".to_string());
    fallback.relay.connect_timeout_ms = 500;
    let (handle, addr, _connector) = start(fallback).await;
    let mut client = connect(addr).await;

    // Act
    send(client.as_mut(), WireRequest::new(Opcode::DeviceList)).await;

    // Assert
    assert_eq!(results(client.as_mut()).await, vec!["SD2SNES LOCAL".to_string()]);
    handle.stop();
    handle.join().await;
}

#[tokio::test]
async fn test_divert_mode_drops_the_session_when_the_target_is_down() {
    let mut divert = config(0, "SD2SNES LOCAL");
    divert.relay.mode = ServerMode::Divert;
    divert.relay.target = Some("ws://127.0.0.1:1".to_string());
    divert.relay.connect_timeout_ms = 500;
    let (handle, addr, _connector) = start(divert).await;
    let mut client = connect(addr).await;

    send(client.as_mut(), WireRequest::new(Opcode::DeviceList)).await;

    assert_eq!(recv(client.as_mut()).await, None);
    handle.stop();
    handle.join().await;
}

// ── Listener lifecycle ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_binds_once_the_port_is_released() {
    // Arrange: occupy the port first
    let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = blocker.local_addr().unwrap().port();
    let connector = SimulatedConnector::new("SD2SNES SIM", "1.11.0");
    let server = Server::new(config(port, "SD2SNES SIM"), DevicePool::new(Arc::new(connector)));
    let mut handle = server.start().unwrap();
    let mut status = handle.subscribe();
    status.wait_for(|s| matches!(s, ServerStatus::Retrying { .. })).await.unwrap();

    // Act
    drop(blocker);
    let addr = tokio::time::timeout(Duration::from_secs(5), handle.listening())
        .await
        .unwrap()
        .unwrap();

    // Assert
    assert_eq!(addr.port(), port);
    handle.stop();
    handle.join().await;
}

// ── Firmware quirks ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_failed_make_dir_ends_the_session() {
    // Arrange
    let (handle, addr, connector) = start(config(0, "SD2SNES SIM")).await;
    let mut client = connect(addr).await;
    attach(client.as_mut(), "SD2SNES SIM").await;
    let make_dir = WireRequest::new(Opcode::MakeDir)
        .with_space(Space::File)
        .with_operands(["/saves"]);

    // Act
    send(client.as_mut(), make_dir.clone()).await;
    send(client.as_mut(), WireRequest::new(Opcode::Info)).await;
    let still_alive = results(client.as_mut()).await;
    send(client.as_mut(), make_dir).await;
    let after_failure = recv(client.as_mut()).await;

    // Assert
    assert!(!still_alive.is_empty());
    assert_eq!(after_failure, None);
    assert!(connector.device().lock().unwrap_or_else(PoisonError::into_inner).is_dir("/saves"));
    wait_until(|| connector.open_links() == 0).await;
    handle.stop();
    handle.join().await;
}

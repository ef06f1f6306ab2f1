//! WebSocket listener: bind (with retry), accept loop, per-connection tasks.
//!
//! This module is responsible for:
//!
//! 1. Binding the configured address.  While the port is taken by another
//!    process the bind is retried on a fixed interval; clearing the running
//!    flag ends the retry.
//! 2. Accepting connections and upgrading each to a WebSocket.
//! 3. Serving each connection in its own task: locally through the session
//!    loop, or relayed upstream in divert and fallback modes.
//!
//! Progress is published as a [`ServerStatus`] on a watch channel so callers
//! can wait for the listener to come up without polling.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use snes_core::transport::WsTransport;
use snes_core::{retry, ContractError, FrameTransport, RetryPolicy};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::domain::config::{ConfigError, DeviceSource, ServerConfig, ServerMode};
use crate::infrastructure::device::{DeviceConnector, HardwareConnector, SimulatedConnector};
use crate::infrastructure::pool::DevicePool;
use crate::infrastructure::relay::{connect_upstream, relay};
use crate::infrastructure::session::handle_session;

/// How often the accept and bind loops look at the running flag.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Stopped,
    Starting,
    /// Port taken; waiting to try again.
    Retrying { port: u16 },
    Running(SocketAddr),
}

impl ServerStatus {
    /// The typed error behind a status that is not serving, if any.
    pub fn error(&self) -> Option<ContractError> {
        match *self {
            ServerStatus::Retrying { port } => Some(ContractError::PortInUse(port)),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("server stopped before it started listening")]
    Stopped,
}

#[derive(Debug, Error)]
enum BindError {
    #[error(transparent)]
    InUse(ContractError),

    #[error("stopped")]
    Stopped,

    #[error("cannot bind {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub struct Server {
    config: Arc<ServerConfig>,
    pool: Arc<DevicePool>,
}

impl Server {
    pub fn new(config: ServerConfig, pool: Arc<DevicePool>) -> Self {
        Self {
            config: Arc::new(config),
            pool,
        }
    }

    /// Builds the device pool the config asks for.
    pub fn from_config(config: ServerConfig) -> Self {
        let connector: Arc<dyn DeviceConnector> = match config.device.source {
            DeviceSource::Hardware => Arc::new(HardwareConnector::new(&config.device)),
            DeviceSource::Simulated => Arc::new(SimulatedConnector::new(
                config.device.simulated_name.clone(),
                config.device.simulated_firmware.clone(),
            )),
        };
        Self::new(config, DevicePool::new(connector))
    }

    pub fn pool(&self) -> &Arc<DevicePool> {
        &self.pool
    }

    /// Validates the config and spawns the listener task.
    ///
    /// # Errors
    ///
    /// [`ServerError::Config`] if the config is inconsistent.
    pub fn start(&self) -> Result<ServerHandle, ServerError> {
        self.config.validate()?;
        let addr = self.config.listen_addr()?;
        let running = Arc::new(AtomicBool::new(true));
        let (status_tx, status_rx) = watch::channel(ServerStatus::Starting);

        let task = tokio::spawn(run_server(
            addr,
            Arc::clone(&self.config),
            Arc::clone(&self.pool),
            Arc::clone(&running),
            status_tx,
        ));

        Ok(ServerHandle {
            running,
            status: status_rx,
            task,
        })
    }
}

/// Control over a started [`Server`].
pub struct ServerHandle {
    running: Arc<AtomicBool>,
    status: watch::Receiver<ServerStatus>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn status(&self) -> ServerStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerStatus> {
        self.status.clone()
    }

    /// Waits until the listener is bound, returning its address.
    ///
    /// # Errors
    ///
    /// [`ServerError::Stopped`] if the server stops first.
    pub async fn listening(&mut self) -> Result<SocketAddr, ServerError> {
        let status = self
            .status
            .wait_for(|s| matches!(s, ServerStatus::Running(_) | ServerStatus::Stopped))
            .await
            .map(|s| *s)
            .unwrap_or(ServerStatus::Stopped);
        match status {
            ServerStatus::Running(addr) => Ok(addr),
            _ => Err(ServerError::Stopped),
        }
    }

    /// Stops accepting (or retrying); sessions already running are left alone.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Waits for the listener task to finish.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("server task failed: {e}");
        }
    }
}

// ── Listener task ─────────────────────────────────────────────────────────────

async fn run_server(
    addr: SocketAddr,
    config: Arc<ServerConfig>,
    pool: Arc<DevicePool>,
    running: Arc<AtomicBool>,
    status: watch::Sender<ServerStatus>,
) {
    let bound = tokio::select! {
        bound = bind_with_retry(addr, config.port_retry_interval(), &running, &status) => bound,
        _ = wait_for_stop(&running) => Err(BindError::Stopped),
    };
    let listener = match bound {
        Ok(listener) => listener,
        Err(BindError::Stopped) => {
            info!("server stopped before binding {addr}");
            status.send_replace(ServerStatus::Stopped);
            return;
        }
        Err(e) => {
            error!("{e}");
            status.send_replace(ServerStatus::Stopped);
            return;
        }
    };

    let local = match listener.local_addr() {
        Ok(local) => local,
        Err(e) => {
            error!("listener has no local address: {e}");
            status.send_replace(ServerStatus::Stopped);
            return;
        }
    };
    info!("usb2snes server listening on {local} ({} mode)", config.relay.mode);
    status.send_replace(ServerStatus::Running(local));

    loop {
        if !running.load(Ordering::Acquire) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(SHUTDOWN_POLL, listener.accept()).await {
            Ok(Ok((stream, peer))) => {
                debug!("connection from {peer}");
                let config = Arc::clone(&config);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    handle_connection(stream, peer, config, pool).await;
                });
            }
            Ok(Err(e)) => error!("accept error: {e}"),
            Err(_) => {}
        }
    }

    drop(listener);
    status.send_replace(ServerStatus::Stopped);
}

async fn bind_with_retry(
    addr: SocketAddr,
    interval: Duration,
    running: &AtomicBool,
    status: &watch::Sender<ServerStatus>,
) -> Result<TcpListener, BindError> {
    let policy = RetryPolicy::forever(interval);
    retry(
        &policy,
        |attempt| async move {
            if !running.load(Ordering::Acquire) {
                return Err(BindError::Stopped);
            }
            match TcpListener::bind(addr).await {
                Ok(listener) => Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    let in_use = ContractError::PortInUse(addr.port());
                    if attempt == 1 {
                        warn!("{in_use}; retrying every {interval:?}");
                    }
                    status.send_replace(ServerStatus::Retrying { port: addr.port() });
                    Err(BindError::InUse(in_use))
                }
                Err(source) => Err(BindError::Io { addr, source }),
            }
        },
        |e| matches!(e, BindError::InUse(in_use) if in_use.is_transient()),
    )
    .await
}

async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::Acquire) {
        sleep(SHUTDOWN_POLL).await;
    }
}

// ── Per-connection handler ────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, config: Arc<ServerConfig>, pool: Arc<DevicePool>) {
    match serve_connection(stream, peer, config, pool).await {
        Ok(()) => debug!("connection {peer} finished"),
        Err(e) => warn!("connection {peer} closed with error: {e:#}"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    config: Arc<ServerConfig>,
    pool: Arc<DevicePool>,
) -> anyhow::Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer}"))?;
    let downstream: Box<dyn FrameTransport> = Box::new(WsTransport::new(ws_stream));

    if config.relay.mode == ServerMode::Local {
        handle_session(downstream, pool).await;
        return Ok(());
    }

    let target = config.relay.target.as_deref().context("relay target is not configured")?;
    let upstream = connect_upstream(target, config.relay.socks_proxy.as_deref(), config.relay_connect_timeout()).await;
    match (upstream, config.relay.mode) {
        (Ok(upstream), _) => {
            info!("relaying {peer} to {target}");
            relay(downstream, upstream)
                .await
                .with_context(|| format!("relay {peer} <-> {target}"))?;
        }
        (Err(e), ServerMode::Fallback) => {
            warn!("{target} unreachable ({e}); serving {peer} locally");
            handle_session(downstream, pool).await;
        }
        (Err(e), _) => return Err(e).with_context(|| format!("cannot divert {peer}")),
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn simulated_config(port: u16) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.server.port = port;
        config.server.port_retry_interval_ms = 50;
        config.device.source = DeviceSource::Simulated;
        config
    }

    #[tokio::test]
    async fn test_port_zero_binds_an_ephemeral_port() {
        // Arrange
        let server = Server::from_config(simulated_config(0));

        // Act
        let mut handle = server.start().unwrap();
        let addr = handle.listening().await.unwrap();

        // Assert
        assert_ne!(addr.port(), 0);
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_spawning() {
        let mut config = simulated_config(0);
        config.relay.mode = ServerMode::Divert;
        let server = Server::from_config(config);
        assert!(matches!(server.start(), Err(ServerError::Config(_))));
    }

    #[tokio::test]
    async fn test_stop_ends_retrying_on_a_taken_port() {
        // Arrange: occupy a port
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();
        let server = Server::from_config(simulated_config(port));
        let handle = server.start().unwrap();
        let mut status = handle.subscribe();

        // Act
        let retrying = *status.wait_for(|s| matches!(s, ServerStatus::Retrying { .. })).await.unwrap();
        handle.stop();
        let mut after = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(2), after.wait_for(|s| *s == ServerStatus::Stopped))
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!(retrying, ServerStatus::Retrying { port });
        assert!(matches!(retrying.error(), Some(ContractError::PortInUse(p)) if p == port));
        assert_eq!(handle.status(), ServerStatus::Stopped);
        assert!(handle.status().error().is_none());
        drop(blocker);
    }
}

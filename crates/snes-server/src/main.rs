//! snes-server: usb2snes-compatible WebSocket server.
//!
//! # Usage
//!
//! ```text
//! snes-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>          Config file [default: platform config dir]
//!   --bind <ADDR>            Listen address
//!   --port <PORT>            Listen port (0 = ephemeral)
//!   --mode <MODE>            local | divert | fallback
//!   --target <URL>           Upstream ws:// server for divert/fallback
//!   --socks-proxy <ADDR>     SOCKS5 proxy used to reach the target
//!   --device-source <SRC>    hardware | simulated
//!   --save-config            Write the effective config back to the file
//!   --log-level <FILTER>     Used when RUST_LOG is unset [default: info]
//! ```
//!
//! Flags override the config file; unset flags leave it untouched.  Every
//! flag can also come from an environment variable (`SNES_SERVER_PORT`, ...).

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use snes_server::domain::{DeviceSource, ServerConfig, ServerMode};
use snes_server::infrastructure::storage::{config_file_path, load_config_from, save_config_to};
use snes_server::Server;

// ── CLI argument definitions ──────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "snes-server",
    about = "usb2snes-compatible server sharing SD2SNES devices between clients",
    version
)]
struct Cli {
    /// Config file to load (and to write with --save-config).
    #[arg(long, env = "SNES_SERVER_CONFIG")]
    config: Option<PathBuf>,

    /// IP address to listen on.
    #[arg(long, env = "SNES_SERVER_BIND")]
    bind: Option<String>,

    /// TCP port to listen on; 0 picks a free port.
    #[arg(long, env = "SNES_SERVER_PORT")]
    port: Option<u16>,

    /// How sessions are served: local, divert or fallback.
    #[arg(long, env = "SNES_SERVER_MODE")]
    mode: Option<ServerMode>,

    /// Upstream server for divert and fallback modes, e.g. ws://10.0.0.2:23074.
    #[arg(long, env = "SNES_SERVER_TARGET")]
    target: Option<String>,

    /// SOCKS5 proxy (host:port) used to reach the target.
    #[arg(long, env = "SNES_SERVER_SOCKS_PROXY")]
    socks_proxy: Option<String>,

    /// Where devices come from: hardware or simulated.
    #[arg(long, env = "SNES_SERVER_DEVICE_SOURCE")]
    device_source: Option<DeviceSource>,

    /// Persist the effective configuration and continue.
    #[arg(long, default_value_t = false)]
    save_config: bool,

    /// Log filter used when `RUST_LOG` is not set.
    #[arg(long, default_value = "info", env = "SNES_SERVER_LOG_LEVEL")]
    log_level: String,
}

impl Cli {
    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.config {
            Some(path) => Ok(path.clone()),
            None => config_file_path().context("no --config given and no platform config directory"),
        }
    }

    /// Loads the config file and applies the flags on top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or the result is invalid.
    fn into_server_config(self) -> anyhow::Result<(ServerConfig, PathBuf)> {
        let path = self.config_path()?;
        let mut config =
            load_config_from(&path).with_context(|| format!("failed to load config from {}", path.display()))?;

        if let Some(bind) = self.bind {
            config.server.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(mode) = self.mode {
            config.relay.mode = mode;
        }
        if let Some(target) = self.target {
            config.relay.target = Some(target);
        }
        if let Some(proxy) = self.socks_proxy {
            config.relay.socks_proxy = Some(proxy);
        }
        if let Some(source) = self.device_source {
            config.device.source = source;
        }

        config.validate().context("invalid configuration")?;
        if self.save_config {
            save_config_to(&config, &path).with_context(|| format!("failed to save config to {}", path.display()))?;
            info!("configuration saved to {}", path.display());
        }
        Ok((config, path))
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let (config, path) = cli.into_server_config()?;
    info!(
        "snes-server starting: {}:{} in {} mode (config {})",
        config.server.bind_address,
        config.server.port,
        config.relay.mode,
        path.display()
    );

    let server = Server::from_config(config);
    let handle = server.start()?;

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C; shutting down"),
        Err(e) => tracing::error!("failed to listen for Ctrl+C signal: {e}"),
    }
    handle.stop();
    handle.join().await;

    info!("snes-server stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

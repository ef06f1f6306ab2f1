//! Tunables of the client protocol engine.
//!
//! The chunk size and backpressure threshold were found empirically against
//! one hardware revision (4096-byte chunks hung the device), so both are
//! plain fields rather than constants.  [`EngineConfig::from_env`] applies the
//! same `USB2SNES_*` overrides other usb2snes clients honour:
//!
//! | Variable                  | Field                    |
//! |---------------------------|--------------------------|
//! | `USB2SNES_CHUNK_SIZE`     | `chunk_size`             |
//! | `USB2SNES_PREEMPTIVE_DIR` | `preemptive_directories` |
//! | `USB2SNES_VERIFY_UPLOAD`  | `verify_uploads`         |
//! | `USB2SNES_TIMEOUT_PER_MB` | `timeout_per_mb` (secs)  |

use std::time::Duration;

use snes_core::retry::{Backoff, RetryPolicy};
use tracing::warn;

/// Default endpoint of a usb2snes-compatible server.
pub const DEFAULT_ENDPOINT: &str = "ws://localhost:23074";
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Deadline for each awaited reply frame.
    pub request_timeout: Duration,
    /// Consecutive timeouts that mark the transport as hung.
    pub hang_threshold: u32,
    /// Bytes per binary frame during uploads.
    pub chunk_size: usize,
    /// Pause uploading while more than this many bytes are queued outbound.
    pub backpressure_threshold: usize,
    /// How often a paused upload re-checks the outbound queue.
    pub backpressure_poll: Duration,
    /// Probe the server after this much idle time; `None` disables probing.
    pub keepalive_interval: Option<Duration>,
    /// Verify uploads by listing the destination directory.
    pub verify_uploads: bool,
    /// Attempts and delays for upload verification.
    pub verification: RetryPolicy,
    /// Attempts and delays when confirming a freshly created directory.
    pub directory_check: RetryPolicy,
    /// Create missing destination directories before uploading.
    pub preemptive_directories: bool,
    /// Blocking upload budget per MiB.
    pub timeout_per_mb: Duration,
    /// Lower bound for the blocking upload budget.
    pub min_blocking_timeout: Duration,
    /// Default budget for blocking downloads.
    pub download_timeout: Duration,
    /// Bounded wait for the savestate flag before triggering.
    pub savestate_wait: Duration,
    /// Bounded wait for the savestate flag after triggering.
    pub savestate_settle_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(5),
            hang_threshold: 3,
            chunk_size: DEFAULT_CHUNK_SIZE,
            backpressure_threshold: 16 * DEFAULT_CHUNK_SIZE,
            backpressure_poll: Duration::from_millis(10),
            keepalive_interval: Some(Duration::from_secs(30)),
            verify_uploads: true,
            verification: RetryPolicy::new(3, Duration::from_millis(500), Backoff::Linear),
            directory_check: RetryPolicy::new(3, Duration::from_millis(200), Backoff::Linear),
            preemptive_directories: true,
            timeout_per_mb: Duration::from_secs(10),
            min_blocking_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(300),
            savestate_wait: Duration::from_secs(5),
            savestate_settle_wait: Duration::from_secs(10),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `USB2SNES_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup`; unparsable values are logged and ignored.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(raw) = lookup("USB2SNES_CHUNK_SIZE") {
            match raw.trim().parse::<usize>() {
                Ok(size) if size > 0 => self.chunk_size = size,
                _ => warn!("ignoring USB2SNES_CHUNK_SIZE={raw:?}"),
            }
        }
        if let Some(raw) = lookup("USB2SNES_PREEMPTIVE_DIR") {
            match parse_flag(&raw) {
                Some(flag) => self.preemptive_directories = flag,
                None => warn!("ignoring USB2SNES_PREEMPTIVE_DIR={raw:?}"),
            }
        }
        if let Some(raw) = lookup("USB2SNES_VERIFY_UPLOAD") {
            match parse_flag(&raw) {
                Some(flag) => self.verify_uploads = flag,
                None => warn!("ignoring USB2SNES_VERIFY_UPLOAD={raw:?}"),
            }
        }
        if let Some(raw) = lookup("USB2SNES_TIMEOUT_PER_MB") {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs > 0.0 && secs.is_finite() => {
                    self.timeout_per_mb = Duration::from_secs_f64(secs)
                }
                _ => warn!("ignoring USB2SNES_TIMEOUT_PER_MB={raw:?}"),
            }
        }
        self
    }

    /// `max(min_blocking_timeout, size_in_MiB * timeout_per_mb)`.
    pub fn blocking_upload_timeout(&self, size: u64) -> Duration {
        let mib = size as f64 / (1024.0 * 1024.0);
        self.min_blocking_timeout
            .max(self.timeout_per_mb.mul_f64(mib))
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

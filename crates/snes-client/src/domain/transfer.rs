//! File transfer options, progress, and cancellation.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Bytes moved so far out of the total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

/// Receives progress after each chunk.
pub type ProgressSink = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Cooperative cancellation flag checked between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Per-call transfer settings.
#[derive(Clone, Default)]
pub struct TransferOptions {
    pub progress: Option<ProgressSink>,
    pub cancel: Option<CancelHandle>,
    /// Overall budget for the blocking variants; defaults come from the engine config.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl TransferOptions {
    pub fn with_progress(mut self, sink: impl Fn(TransferProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(sink));
        self
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelHandle::is_cancelled)
    }
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub path: String,
    pub bytes: u64,
    pub chunks: usize,
    pub verified: bool,
    pub elapsed: Duration,
}

/// Transient bookkeeping for one upload or download.
pub(crate) struct FileTransferSession {
    pub path: String,
    pub total: u64,
    pub transferred: u64,
    pub chunks: usize,
    progress: Option<ProgressSink>,
    started: Instant,
}

impl FileTransferSession {
    pub fn new(path: &str, total: u64, options: &TransferOptions) -> Self {
        Self {
            path: path.to_string(),
            total,
            transferred: 0,
            chunks: 0,
            progress: options.progress.clone(),
            started: Instant::now(),
        }
    }

    pub fn advance(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
        self.chunks += 1;
        if let Some(sink) = &self.progress {
            sink(TransferProgress {
                transferred: self.transferred,
                total: self.total,
            });
        }
    }

    pub fn finish(self, verified: bool) -> TransferReport {
        TransferReport {
            path: self.path,
            bytes: self.transferred,
            chunks: self.chunks,
            verified,
            elapsed: self.started.elapsed(),
        }
    }
}

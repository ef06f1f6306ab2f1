//! Bounded retry with backoff.
//!
//! One combinator serves every "try again shortly" site: upload verification,
//! directory checks after a fire-and-forget `MakeDir`, and the server's
//! port-bind loop (which uses an unbounded policy and stops through its own
//! non-transient error).

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed,
    /// `initial * attempt`.
    Linear,
    /// `initial * 2^(attempt - 1)`.
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub backoff: Backoff,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            initial_delay,
            backoff,
            max_delay: Duration::from_secs(30),
        }
    }

    /// Retries on a fixed interval until the operation stops failing transiently.
    pub fn forever(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_delay: interval,
            backoff: Backoff::Fixed,
            max_delay: interval,
        }
    }

    /// Single attempt, no retry.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Backoff::Fixed)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Linear => self.initial_delay.saturating_mul(attempt),
            Backoff::Exponential => self
                .initial_delay
                .saturating_mul(1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX)),
        };
        delay.min(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempt >= max)
    }
}

/// Runs `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts.  `op` receives the 1-based attempt number.
///
/// # Errors
///
/// Returns the last error produced by `op`.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, mut op: F, is_transient: P) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && !policy.exhausted(attempt) => {
                let delay = policy.delay_after(attempt);
                debug!("attempt {attempt} failed ({e}); retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

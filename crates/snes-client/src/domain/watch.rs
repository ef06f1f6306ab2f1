//! Descriptions of memory to watch and the changes a watcher reports.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// What a watched region must contain to count as a match.
#[derive(Clone)]
pub enum WatchTarget {
    /// The first byte equals this value.
    Byte(u8),
    /// The whole region equals these bytes.
    Bytes(Vec<u8>),
    /// Caller-supplied test over the region.
    Predicate(Arc<dyn Fn(&[u8]) -> bool + Send + Sync>),
}

impl WatchTarget {
    pub fn predicate(f: impl Fn(&[u8]) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate(Arc::new(f))
    }

    pub fn matches(&self, value: &[u8]) -> bool {
        match self {
            Self::Byte(expected) => value.first() == Some(expected),
            Self::Bytes(expected) => value == expected.as_slice(),
            Self::Predicate(test) => test(value),
        }
    }
}

impl fmt::Debug for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Byte(b) => f.debug_tuple("Byte").field(b).finish(),
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// One region that must match for `watch_for_conditions` to return.
#[derive(Debug, Clone)]
pub struct WatchCondition {
    pub address: u32,
    pub size: u32,
    pub target: WatchTarget,
}

impl WatchCondition {
    pub fn new(address: u32, size: u32, target: WatchTarget) -> Self {
        Self { address, size, target }
    }
}

/// Polling cadence and deadline of the watch helpers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOptions {
    /// `Duration::ZERO` waits forever.
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// A region whose bytes differ from the previous poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChange {
    /// Position of the region in the watcher's region list.
    pub index: usize,
    pub address: u32,
    pub size: u32,
    pub old: Vec<u8>,
    pub new: Vec<u8>,
}

/// Invoked once per poll that found at least one change.
pub type ChangeCallback = Arc<dyn Fn(&[MemoryChange]) + Send + Sync>;

/// Compares two snapshots taken over the same `regions`.
pub fn diff_snapshots(regions: &[(u32, u32)], old: &[Vec<u8>], new: &[Vec<u8>]) -> Vec<MemoryChange> {
    regions
        .iter()
        .zip(old.iter().zip(new.iter()))
        .enumerate()
        .filter(|(_, (_, (before, after)))| before != after)
        .map(|(index, (&(address, size), (before, after)))| MemoryChange {
            index,
            address,
            size,
            old: before.clone(),
            new: after.clone(),
        })
        .collect()
}

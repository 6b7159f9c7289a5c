//! Time source for LRU stamps and mtimes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Nanoseconds since the Unix epoch.
    fn now(&self) -> u64;
}

/// Reads the system clock once and advances from there on a monotonic
/// `Instant`, so stamps never go backwards when the system time is set
/// back. Stamps stay comparable with those written by earlier processes.
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    base_nanos: u64,
    base: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        let base_nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        Self {
            base_nanos,
            base: Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for WallClock {
    fn now(&self) -> u64 {
        self.base_nanos.saturating_add(self.base.elapsed().as_nanos() as u64)
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Default)]
pub struct TestClock {
    nanos: AtomicU64,
}

impl TestClock {
    pub fn new(start: u64) -> Self {
        Self {
            nanos: AtomicU64::new(start),
        }
    }

    pub fn add(&self, d: Duration) {
        self.nanos.fetch_add(d.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> u64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

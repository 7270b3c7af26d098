//! Time sources for bucket accounting.

use std::fmt::Debug;

/// Millisecond time source for refill accounting.
///
/// Buckets read time through this trait so the accounting math can be driven
/// deterministically in tests. The default [`SystemClock`] reads wall-clock
/// time, which is what persisted refill timestamps are keyed to across
/// process restarts.
pub trait Clock: Send + Sync + Debug {
    /// Current time in milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time in Unix epoch milliseconds.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        chrono::Utc::now().timestamp_millis() as u64
    }
}

/// Clock following the tokio runtime, so paused test time is observed.
#[cfg(test)]
#[derive(Debug)]
pub(crate) struct RuntimeClock {
    base: tokio::time::Instant,
}

#[cfg(test)]
impl RuntimeClock {
    pub(crate) fn new() -> Self {
        Self {
            base: tokio::time::Instant::now(),
        }
    }
}

#[cfg(test)]
impl Clock for RuntimeClock {
    fn now_ms(&self) -> u64 {
        self.base.elapsed().as_millis() as u64
    }
}

//! Token bucket state and hierarchical admission.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::config::BucketConfig;
use crate::error::{CascadeError, Result};

/// Mutable accounting state of a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BucketState {
    pub(crate) tokens_left: f64,
    pub(crate) last_refill_ms: u64,
}

/// A token bucket that can be chained into a parent/child hierarchy.
///
/// A bucket admits work by removing tokens from a pool that refills over
/// time. When a bucket has a parent, admission additionally requires the
/// parent, and transitively every ancestor, to admit the same request. A
/// parent may be shared by any number of children.
///
/// Mutable state is guarded by a per-bucket lock. Locks along a chain are
/// always acquired child first, then ancestors, and are never held across a
/// suspension point, so buckets can be shared freely across tasks.
#[derive(Debug)]
pub struct Bucket {
    capacity: f64,
    refill_rate: f64,
    interval_ms: u64,
    spread: bool,
    max_wait_ms: Option<u64>,
    key: Option<String>,
    parent: Option<Arc<Bucket>>,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl Bucket {
    /// Create a standalone bucket from its configuration.
    pub fn new(config: BucketConfig) -> Self {
        Self::with_clock(config, None, Arc::new(SystemClock))
    }

    /// Create a bucket gated by `parent`.
    pub fn with_parent(config: BucketConfig, parent: Arc<Bucket>) -> Self {
        Self::with_clock(config, Some(parent), Arc::new(SystemClock))
    }

    /// Create a bucket with an explicit parent and time source.
    pub fn with_clock(
        config: BucketConfig,
        parent: Option<Arc<Bucket>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now_ms();
        let tokens = config
            .tokens
            .unwrap_or(config.capacity)
            .min(config.capacity);
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            interval_ms: config.interval_ms,
            spread: config.spread,
            max_wait_ms: config.max_wait_ms,
            key: config.key,
            parent,
            clock,
            state: Mutex::new(BucketState {
                tokens_left: tokens,
                last_refill_ms: now,
            }),
        }
    }

    /// Maximum tokens this bucket can hold. May be infinite.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Parent bucket, if any.
    pub fn parent(&self) -> Option<&Arc<Bucket>> {
        self.parent.as_ref()
    }

    /// Persistence identity, if configured.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Run the refill step and return the current token count.
    pub fn available(&self) -> f64 {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens_left
    }

    /// Immediately remove `n` tokens from this bucket and every ancestor.
    ///
    /// Succeeds only if the whole chain currently holds enough tokens; on
    /// failure no bucket is debited. The refill step runs regardless, so
    /// token counts may still advance on a failing call.
    pub fn try_remove(&self, n: f64) -> bool {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        if n > self.capacity || n > state.tokens_left {
            trace!(
                requested = n,
                available = state.tokens_left,
                "Immediate admission rejected"
            );
            return false;
        }
        if let Some(parent) = &self.parent {
            // Self's lock is held across the parent probe, so the chain
            // debit is all-or-nothing.
            if !parent.try_remove(n) {
                return false;
            }
        }
        state.tokens_left -= n;
        true
    }

    /// Remove `n` tokens, waiting for the hierarchy to refill as needed.
    ///
    /// Resolves with the smallest remaining token count along the chain.
    /// Fails with [`CascadeError::NoInfinityRemoval`] for an unbounded
    /// request, [`CascadeError::NotEnoughSize`] when `n` exceeds this
    /// bucket's capacity, and [`CascadeError::ExceedsMaxWait`] when the
    /// combined wait across the chain exceeds the tightest configured
    /// ceiling. All three are checked before any token is debited.
    pub async fn remove(&self, n: f64) -> Result<f64> {
        self.remove_chain(n).await
    }

    /// Recursive body of [`Bucket::remove`].
    ///
    /// Structured as a loop that recomputes everything from scratch after
    /// every suspension: refills during a wait may have changed the picture
    /// for any bucket in the chain, so no intermediate result survives a
    /// retry.
    fn remove_chain(&self, n: f64) -> BoxFuture<'_, Result<f64>> {
        Box::pin(async move {
            if n.is_infinite() {
                return Err(CascadeError::NoInfinityRemoval);
            }
            if n > self.capacity {
                return Err(CascadeError::NotEnoughSize {
                    requested: n,
                    capacity: self.capacity,
                });
            }
            loop {
                let now = self.clock.now_ms();
                let (tokens_left, self_wait) = {
                    let mut state = self.state.lock();
                    self.refill(&mut state, now);
                    (state.tokens_left, self.wait_for_ms(&state, n, now))
                };

                // Aggregate the wait over the ancestor chain and find the
                // tightest ceiling before touching any state.
                let mut total_wait = self_wait;
                let mut max_wait = self.max_wait_ms;
                let mut ancestor = self.parent.as_deref();
                while let Some(bucket) = ancestor {
                    let now = bucket.clock.now_ms();
                    let state = bucket.state.lock();
                    total_wait = total_wait.saturating_add(bucket.wait_for_ms(&state, n, now));
                    drop(state);
                    max_wait = match (max_wait, bucket.max_wait_ms) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    ancestor = bucket.parent.as_deref();
                }
                if let Some(max_ms) = max_wait {
                    if total_wait > max_ms {
                        debug!(
                            requested = n,
                            required_ms = total_wait,
                            max_wait_ms = max_ms,
                            "Admission exceeds maximum wait"
                        );
                        return Err(CascadeError::ExceedsMaxWait {
                            required_ms: total_wait,
                            max_ms,
                        });
                    }
                }

                if n > tokens_left {
                    trace!(
                        requested = n,
                        available = tokens_left,
                        wait_ms = self_wait,
                        "Waiting for refill"
                    );
                    tokio::time::sleep(Duration::from_millis(self_wait)).await;
                    continue;
                }

                if let Some(parent) = &self.parent {
                    // Time passes inside the parent's own wait, so self is
                    // re-checked afterwards and the parent debit undone if
                    // self fell short in the meantime.
                    let snapshot = parent.snapshot();
                    let parent_remaining = parent.remove_chain(n).await?;
                    let now = self.clock.now_ms();
                    let remaining = {
                        let mut state = self.state.lock();
                        self.refill(&mut state, now);
                        if n > state.tokens_left {
                            None
                        } else {
                            state.tokens_left -= n;
                            Some(state.tokens_left)
                        }
                    };
                    match remaining {
                        None => {
                            parent.restore(snapshot);
                            debug!(requested = n, "Parent debit rolled back, retrying");
                            tokio::time::sleep(Duration::from_millis(self_wait)).await;
                            continue;
                        }
                        Some(remaining) => return Ok(remaining.min(parent_remaining)),
                    }
                }

                let mut state = self.state.lock();
                // Another task may have debited between the check above and
                // here; recompute from the top if so.
                if n > state.tokens_left {
                    continue;
                }
                state.tokens_left -= n;
                return Ok(state.tokens_left);
            }
        })
    }

    /// Top up the token pool for time elapsed since the last refill.
    ///
    /// In spread mode fractional tokens accrue on every call. In discrete
    /// mode nothing is credited until a full interval has passed.
    fn refill(&self, state: &mut BucketState, now: u64) {
        let elapsed = now.saturating_sub(state.last_refill_ms);
        let accrued = if elapsed > 0 {
            elapsed as f64 * self.refill_rate / self.interval_ms as f64
        } else {
            0.0
        };
        if self.spread || elapsed >= self.interval_ms {
            state.last_refill_ms = now;
            state.tokens_left = (state.tokens_left + accrued).min(self.capacity);
        }
    }

    /// Milliseconds until this bucket will hold `n` tokens, given its
    /// current state and time elapsed since its last refill. In discrete
    /// mode tokens only land at full-interval boundaries, so the needed
    /// count is rounded up to whole intervals.
    fn wait_for_ms(&self, state: &BucketState, n: f64, now: u64) -> u64 {
        let needed = n - state.tokens_left;
        if needed <= 0.0 {
            return 0;
        }
        let elapsed = now.saturating_sub(state.last_refill_ms) as f64;
        let interval = self.interval_ms as f64;
        let wait = if self.spread {
            needed * interval / self.refill_rate - elapsed
        } else {
            (needed / self.refill_rate).ceil() * interval - elapsed
        };
        wait.max(0.0).ceil() as u64
    }

    pub(crate) fn snapshot(&self) -> BucketState {
        *self.state.lock()
    }

    pub(crate) fn restore(&self, state: BucketState) {
        *self.state.lock() = state;
    }
}

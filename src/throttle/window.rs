//! Sliding-window rate counter
//!
//! Keeps a rolling sum of amounts pushed over the trailing window. Samples are
//! bucketed per millisecond: pushes landing in the same millisecond as the
//! newest sample are merged into it, so the ring never needs more than one
//! slot per millisecond of window.
//!
//! Sample timestamps are 32-bit offsets from `timestamp_base`. Once the clock
//! runs more than [`REBASE_THRESHOLD`] past the base, the base is moved up to
//! the oldest live sample and every stored offset is shifted down by the same
//! amount. This happens lazily on the next operation that looks at the ring.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Clock distance past the base (in ms) that triggers a rebase
pub(crate) const REBASE_THRESHOLD: u64 = 1 << 31;

#[derive(Debug, Clone, Copy)]
struct Sample {
    stamp: u32,
    amount: u32,
}

#[derive(Debug)]
struct Ring {
    samples: VecDeque<Sample>,
    capacity: usize,
    sum: u64,
    base: u64,
}

/// Rolling sum over a trailing time window with a rate limit.
///
/// A rate of zero disables the counter: pushes are ignored and `min_wait` is
/// always zero.
#[derive(Debug)]
pub struct SlidingWindowCounter {
    rate: u32,
    window_ms: u64,
    epoch: Instant,
    ring: Mutex<Ring>,
}

impl SlidingWindowCounter {
    /// Counter allowing `rate` units per second averaged over `window`.
    pub fn new(rate: u32, window: Duration) -> Self {
        let window_ms = (window.as_millis() as u64).max(1);
        let capacity = if rate == 0 { 0 } else { window_ms as usize };
        Self {
            rate,
            window_ms,
            epoch: Instant::now(),
            ring: Mutex::new(Ring {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                sum: 0,
                base: 0,
            }),
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    /// Largest sum allowed inside one window.
    pub fn limit(&self) -> u64 {
        u64::from(self.rate) * self.window_ms / 1000
    }

    /// Live sum after dropping expired samples.
    pub fn sum(&self) -> u64 {
        self.sum_at(self.now_ms())
    }

    /// Drop samples whose window has fully elapsed.
    pub fn pop_expired(&self) {
        self.pop_expired_at(self.now_ms());
    }

    /// Time to wait before the sum is back within the limit.
    pub fn min_wait(&self) -> Duration {
        self.min_wait_at(self.now_ms())
    }

    /// Record `amount` now, waiting as long as the ring is full.
    pub async fn push(&self, amount: u32) -> Result<()> {
        self.push_timeout(amount, None).await
    }

    /// Record `amount` now, giving up with [`Error::QueueTimeout`] if the ring
    /// stays full for longer than `timeout`.
    pub async fn push_timeout(&self, amount: u32, timeout: Option<Duration>) -> Result<()> {
        if self.is_unlimited() {
            return Ok(());
        }
        let start = Instant::now();
        loop {
            let retry_at = match self.try_push_at(amount, self.now_ms()) {
                Ok(()) => return Ok(()),
                Err(retry_at) => retry_at,
            };
            let mut wake = self.epoch + Duration::from_millis(retry_at);
            if let Some(timeout) = timeout {
                let deadline = start + timeout;
                if Instant::now() >= deadline {
                    return Err(Error::QueueTimeout {
                        waited: start.elapsed(),
                    });
                }
                wake = wake.min(deadline);
            }
            tracing::trace!(retry_at, "statistics ring full, waiting");
            tokio::time::sleep_until(wake).await;
        }
    }

    fn now_ms(&self) -> u64 {
        Instant::now().duration_since(self.epoch).as_millis() as u64
    }

    #[cfg(test)]
    pub(crate) fn timestamp_base(&self) -> u64 {
        self.ring.lock().base
    }

    // ---------------------------------------------------------------------
    // Clock-explicit operations; `now` is milliseconds since `epoch`.
    // ---------------------------------------------------------------------

    /// Push at `now`, or return the time at which the head sample expires.
    pub(crate) fn try_push_at(&self, amount: u32, now: u64) -> std::result::Result<(), u64> {
        if self.is_unlimited() {
            return Ok(());
        }
        let mut guard = self.ring.lock();
        let ring = &mut *guard;
        self.evict(ring, now);
        Self::rebase(ring, now);

        let stamp = (now - ring.base) as u32;
        if let Some(back) = ring.samples.back_mut() {
            if back.stamp == stamp {
                if let Some(merged) = back.amount.checked_add(amount) {
                    back.amount = merged;
                    ring.sum += u64::from(amount);
                    return Ok(());
                }
            }
        }
        if ring.samples.len() >= ring.capacity {
            let head_expiry = ring
                .samples
                .front()
                .map(|s| self.expiry(ring.base, s))
                .unwrap_or(now);
            return Err(head_expiry.max(now + 1));
        }
        ring.samples.push_back(Sample { stamp, amount });
        ring.sum += u64::from(amount);
        Ok(())
    }

    pub(crate) fn pop_expired_at(&self, now: u64) {
        if self.is_unlimited() {
            return;
        }
        let mut ring = self.ring.lock();
        self.evict(&mut ring, now);
        Self::rebase(&mut ring, now);
    }

    pub(crate) fn sum_at(&self, now: u64) -> u64 {
        if self.is_unlimited() {
            return 0;
        }
        let mut ring = self.ring.lock();
        self.evict(&mut ring, now);
        Self::rebase(&mut ring, now);
        ring.sum
    }

    pub(crate) fn min_wait_at(&self, now: u64) -> Duration {
        let sum = self.sum_at(now);
        let limit = self.limit();
        if sum <= limit {
            return Duration::ZERO;
        }
        Duration::from_micros((sum - limit) * 1_000_000 / u64::from(self.rate))
    }

    /// First millisecond at which `sample` no longer counts: the window has
    /// passed and, for large samples, the amount has drained at `rate`.
    fn expiry(&self, base: u64, sample: &Sample) -> u64 {
        let time = base + u64::from(sample.stamp);
        let drain = u64::from(sample.amount) * 1000 / u64::from(self.rate);
        (time + self.window_ms + 1).max(time + drain)
    }

    fn evict(&self, ring: &mut Ring, now: u64) {
        while let Some(front) = ring.samples.front().copied() {
            if self.expiry(ring.base, &front) > now {
                break;
            }
            ring.samples.pop_front();
            ring.sum -= u64::from(front.amount);
        }
    }

    fn rebase(ring: &mut Ring, now: u64) {
        if now - ring.base <= REBASE_THRESHOLD {
            return;
        }
        let oldest = ring
            .samples
            .front()
            .map(|s| ring.base + u64::from(s.stamp))
            .unwrap_or(now);
        let new_base = oldest.min(now);
        let delta = (new_base - ring.base) as u32;
        for sample in ring.samples.iter_mut() {
            sample.stamp -= delta;
        }
        tracing::debug!(old = ring.base, new = new_base, "rebased window timestamps");
        ring.base = new_base;
    }
}

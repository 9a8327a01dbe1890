//! Byte-range lock
//!
//! Holds a set of disjoint `[start, end)` ranges. Acquiring a range waits
//! until no held range overlaps it; disjoint ranges are granted concurrently.
//! A range is released when its [`RangeGuard`] drops, on every exit path.

use std::collections::BTreeMap;
use std::ops::Range;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Interval lock registry for one cache entry.
#[derive(Debug, Default)]
pub struct RangeLock {
    // start -> end, pairwise disjoint
    held: Mutex<BTreeMap<u64, u64>>,
    released: Notify,
}

impl RangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `[offset, offset + len)` overlaps no held range, then hold it.
    pub async fn lock(&self, offset: u64, len: u64) -> RangeGuard<'_> {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed.
            notified.as_mut().enable();

            if let Some(guard) = self.try_lock(offset, len) {
                return guard;
            }
            notified.await;
        }
    }

    /// Hold the range if nothing overlapping is held.
    pub fn try_lock(&self, offset: u64, len: u64) -> Option<RangeGuard<'_>> {
        let end = offset.saturating_add(len);
        if offset >= end {
            return Some(RangeGuard {
                lock: self,
                range: None,
            });
        }

        let mut held = self.held.lock();
        if let Some((_, &held_end)) = held.range(..end).next_back() {
            if held_end > offset {
                return None;
            }
        }
        held.insert(offset, end);
        Some(RangeGuard {
            lock: self,
            range: Some(offset..end),
        })
    }

    /// Currently held ranges, ascending.
    pub fn held(&self) -> Vec<Range<u64>> {
        self.held.lock().iter().map(|(&s, &e)| s..e).collect()
    }

    fn release(&self, start: u64) {
        self.held.lock().remove(&start);
        self.released.notify_waiters();
    }
}

/// A held range; released on drop.
#[derive(Debug)]
pub struct RangeGuard<'a> {
    lock: &'a RangeLock,
    range: Option<Range<u64>>,
}

impl RangeGuard<'_> {
    /// The held range; `None` for an empty request.
    pub fn range(&self) -> Option<&Range<u64>> {
        self.range.as_ref()
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        if let Some(range) = self.range.take() {
            self.lock.release(range.start);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn test_disjoint_ranges_do_not_block() {
        let lock = RangeLock::new();
        let a = lock.lock(0, 100).await;
        let b = lock.lock(200, 100).await;
        // adjacent is not overlapping
        let c = lock.lock(100, 100).await;

        assert_eq!(lock.held(), vec![0..100, 100..200, 200..300]);
        drop((a, b, c));
        assert!(lock.held().is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_range_waits_for_release() {
        let lock = RangeLock::new();
        let first = lock.lock(0, 100).await;

        let mut second = task::spawn(lock.lock(50, 100));
        assert_pending!(second.poll());

        drop(first);
        assert!(second.is_woken());
        let guard = assert_ready!(second.poll());
        assert_eq!(guard.range(), Some(&(50..150)));
    }

    #[tokio::test]
    async fn test_waiter_stays_blocked_by_other_overlap() {
        let lock = RangeLock::new();
        let left = lock.lock(0, 10).await;
        let right = lock.lock(20, 10).await;

        let mut wide = task::spawn(lock.lock(5, 20));
        assert_pending!(wide.poll());

        drop(left);
        assert_pending!(wide.poll());
        drop(right);
        assert_ready!(wide.poll());
    }

    #[tokio::test]
    async fn test_containing_range_conflicts() {
        let lock = RangeLock::new();
        let _inner = lock.lock(40, 10).await;

        assert!(lock.try_lock(0, 100).is_none());
        assert!(lock.try_lock(45, 1).is_none());
        assert!(lock.try_lock(50, 1).is_some());
    }

    #[tokio::test]
    async fn test_empty_range_is_not_registered() {
        let lock = RangeLock::new();
        let _all = lock.lock(0, u64::MAX).await;

        let guard = lock.try_lock(10, 0).unwrap();
        assert!(guard.range().is_none());
        assert_eq!(lock.held().len(), 1);
    }
}

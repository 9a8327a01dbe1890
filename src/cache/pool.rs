//! Cache pool interface
//!
//! The pool owns capacity accounting and the LRU order across every cache
//! entry. A [`CacheStore`](super::CacheStore) only talks to it through
//! [`CachePool`]; which entries get reclaimed is the pool's business.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, RwLock};
use tracing::debug;

/// Opaque reference to a pool entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryHandle(u64);

impl EntryHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// A pool entry as seen by its cache store.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    handle: EntryHandle,
    lock: Arc<RwLock<()>>,
}

impl CacheEntry {
    pub fn new(handle: EntryHandle) -> Self {
        Self {
            handle,
            lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn handle(&self) -> EntryHandle {
        self.handle
    }

    /// Shared/exclusive lock of the entry. Reads take it shared.
    pub fn lock(&self) -> &RwLock<()> {
        &self.lock
    }
}

/// Operations a cache store may perform on its pool.
pub trait CachePool: Send + Sync {
    /// Mark the entry as most recently used.
    fn update_recency(&self, handle: EntryHandle);

    /// Report the entry's current on-disk usage in bytes. The pool derives
    /// the change from the previously reported value.
    fn update_space(&self, handle: EntryHandle, disk_usage: u64);

    /// True when no capacity is left for new data.
    fn is_full(&self) -> bool;

    /// Ask the pool to reclaim space now. Must not block.
    fn force_recycle(&self);

    /// The entry's store has closed.
    fn remove_open_file(&self, handle: EntryHandle);
}

// =============================================================================
// LRU Pool
// =============================================================================

#[derive(Debug)]
struct EntryState {
    name: String,
    size: u64,
    last_used: u64,
    open: bool,
}

/// In-process pool tracking size and recency of each entry.
///
/// `capacity == 0` disables the capacity check. Recycling requests are
/// counted and signalled through [`recycle_requested`](Self::recycle_requested);
/// a reclaimer task waits on that, picks victims from
/// [`lru_order`](Self::lru_order) and calls [`remove_entry`](Self::remove_entry).
#[derive(Debug)]
pub struct LruPool {
    capacity: u64,
    entries: DashMap<EntryHandle, EntryState>,
    next_handle: AtomicU64,
    tick: AtomicU64,
    used: AtomicU64,
    recycles: AtomicU64,
    recycle: Notify,
}

impl LruPool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            entries: DashMap::new(),
            next_handle: AtomicU64::new(1),
            tick: AtomicU64::new(0),
            used: AtomicU64::new(0),
            recycles: AtomicU64::new(0),
            recycle: Notify::new(),
        }
    }

    /// Register a new open entry.
    pub fn open_entry(&self, name: impl Into<String>) -> CacheEntry {
        let handle = EntryHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!(entry = handle.id(), name = %name, "opened cache entry");
        self.entries.insert(
            handle,
            EntryState {
                name,
                size: 0,
                last_used: self.tick.fetch_add(1, Ordering::Relaxed),
                open: true,
            },
        );
        CacheEntry::new(handle)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes in use across all entries.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn entry_size(&self, handle: EntryHandle) -> Option<u64> {
        self.entries.get(&handle).map(|e| e.size)
    }

    pub fn entry_name(&self, handle: EntryHandle) -> Option<String> {
        self.entries.get(&handle).map(|e| e.name.clone())
    }

    pub fn is_open(&self, handle: EntryHandle) -> bool {
        self.entries.get(&handle).map(|e| e.open).unwrap_or(false)
    }

    /// Entries from least to most recently used.
    pub fn lru_order(&self) -> Vec<EntryHandle> {
        let mut order: Vec<(u64, EntryHandle)> = self
            .entries
            .iter()
            .map(|e| (e.last_used, *e.key()))
            .collect();
        order.sort_unstable();
        order.into_iter().map(|(_, handle)| handle).collect()
    }

    /// Forget an entry, returning the space it held.
    pub fn remove_entry(&self, handle: EntryHandle) -> Option<u64> {
        let (_, state) = self.entries.remove(&handle)?;
        self.used.fetch_sub(state.size, Ordering::Relaxed);
        Some(state.size)
    }

    /// Number of `force_recycle` calls so far.
    pub fn recycle_requests(&self) -> u64 {
        self.recycles.load(Ordering::Relaxed)
    }

    /// Resolves on the next (or a pending) `force_recycle`.
    pub fn recycle_requested(&self) -> Notified<'_> {
        self.recycle.notified()
    }
}

impl CachePool for LruPool {
    fn update_recency(&self, handle: EntryHandle) {
        if let Some(mut entry) = self.entries.get_mut(&handle) {
            entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn update_space(&self, handle: EntryHandle, disk_usage: u64) {
        let Some(mut entry) = self.entries.get_mut(&handle) else {
            return;
        };
        let old = std::mem::replace(&mut entry.size, disk_usage);
        if disk_usage >= old {
            self.used.fetch_add(disk_usage - old, Ordering::Relaxed);
        } else {
            self.used.fetch_sub(old - disk_usage, Ordering::Relaxed);
        }
    }

    fn is_full(&self) -> bool {
        self.capacity != 0 && self.used() >= self.capacity
    }

    fn force_recycle(&self) {
        let n = self.recycles.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(requests = n, used = self.used(), "forced recycle requested");
        self.recycle.notify_one();
    }

    fn remove_open_file(&self, handle: EntryHandle) {
        if let Some(mut entry) = self.entries.get_mut(&handle) {
            entry.open = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn test_lru_order_follows_recency() {
        let pool = LruPool::new(0);
        let a = pool.open_entry("a").handle();
        let b = pool.open_entry("b").handle();
        let c = pool.open_entry("c").handle();

        pool.update_recency(a);
        assert_eq!(pool.lru_order(), vec![b, c, a]);

        pool.update_recency(b);
        assert_eq!(pool.lru_order(), vec![c, a, b]);
    }

    #[test]
    fn test_space_accounting_uses_deltas() {
        let pool = LruPool::new(10_000);
        let a = pool.open_entry("a").handle();
        let b = pool.open_entry("b").handle();

        pool.update_space(a, 4096);
        pool.update_space(b, 4096);
        pool.update_space(a, 8192);
        assert_eq!(pool.used(), 12288);
        assert!(pool.is_full());

        pool.update_space(a, 0);
        assert_eq!(pool.used(), 4096);
        assert!(!pool.is_full());

        assert_eq!(pool.remove_entry(b), Some(4096));
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_zero_capacity_is_never_full() {
        let pool = LruPool::new(0);
        let a = pool.open_entry("a").handle();
        pool.update_space(a, u64::MAX / 2);
        assert!(!pool.is_full());
    }

    #[test]
    fn test_remove_open_file_keeps_accounting() {
        let pool = LruPool::new(0);
        let a = pool.open_entry("a").handle();
        pool.update_space(a, 512);

        pool.remove_open_file(a);
        assert!(!pool.is_open(a));
        assert_eq!(pool.entry_size(a), Some(512));
        assert_eq!(pool.entry_name(a).as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_force_recycle_wakes_reclaimer() {
        let pool = LruPool::new(0);
        let mut waiter = task::spawn(pool.recycle_requested());
        assert_pending!(waiter.poll());

        pool.force_recycle();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
        assert_eq!(pool.recycle_requests(), 1);
    }
}

//! Cache Store
//!
//! Local-disk cache of one lazily fetched remote object:
//!
//! - [`CacheStore`] - reads, range-locked writes, refill queries and eviction
//! - [`RangeLock`] - byte-range lock serializing overlapping writes
//! - [`refill_range`] - extent-hole merging behind `query_refill_range`
//! - [`CachePool`] - capacity and LRU interface the store reports to, with
//!   [`LruPool`] as the in-process implementation

mod pool;
mod range_lock;
mod refill;
mod store;

pub use pool::{CacheEntry, CachePool, EntryHandle, LruPool};
pub use range_lock::{RangeGuard, RangeLock};
pub use refill::{align_down, align_up, refill_range, RefillRange, REFILL_BLOCK_SIZE};
pub use store::{CacheStore, EvictSpan, AUDIT_TARGET};

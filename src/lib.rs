//! rangecache - Rate-Limited, Range-Locked Local Cache Store
//!
//! The local-disk layer beneath a virtual file serving lazily fetched remote
//! data. It decides which parts of a requested range are already on local
//! disk, lets readers and range-disjoint writers share one cache file, and
//! keeps fill and read traffic inside configured IOPS, throughput and
//! concurrency limits.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ CacheStore ──▶ ThrottledFile ──▶ LocalFile
//!              │  range lock     │  admission (rw + read/write tier)
//!              │  refill query   │  block-size split
//!              ▼
//!           CachePool (capacity, LRU)
//! ```
//!
//! # Modules
//!
//! - [`cache`] - cache store, byte-range lock, refill computation, pool interface
//! - [`config`] - throttle limits and store configuration
//! - [`error`] - error types
//! - [`file`] - async file interface with local and in-memory implementations
//! - [`metrics`] - I/O and store counters
//! - [`split`] - block-splitting driver and scattered-buffer cursor
//! - [`throttle`] - sliding-window counters, tiers, admission, throttled file

pub mod cache;
pub mod config;
pub mod error;
pub mod file;
pub mod metrics;
pub mod split;
pub mod throttle;

// Re-export commonly used types
pub use cache::{CachePool, CacheStore, EvictSpan, LruPool, RefillRange};
pub use config::{CacheStoreConfig, Config, ThrottleLimits, UpperLimits};
pub use error::{Error, Result};
pub use file::{AsyncFile, LocalFile, MemoryFile};
pub use throttle::ThrottledFile;

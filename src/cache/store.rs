use std::io::{self, IoSlice, IoSliceMut};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::pool::{CacheEntry, CachePool};
use super::range_lock::RangeLock;
use super::refill::{align_down, align_up, refill_range, RefillRange, REFILL_BLOCK_SIZE};
use crate::config::CacheStoreConfig;
use crate::error::{Error, Result};
use crate::file::{AsyncFile, FallocateMode, FileStat};
use crate::metrics::StoreStats;

/// Tracing target for slow-operation audit records
pub const AUDIT_TARGET: &str = "rangecache::audit";

/// How much of the file [`CacheStore::evict`] drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictSpan {
    /// Truncate the file at the offset
    ToEnd,
    /// Punch a hole of this many bytes, keeping the file size
    Len(u64),
}

/// Local cache file of one remote object.
///
/// Reads share the entry lock and never wait for writes. Writes take a byte
/// range lock, so only writes to overlapping ranges serialize. Extent-map
/// queries take the same range lock over their aligned window.
pub struct CacheStore<F: AsyncFile> {
    file: F,
    pool: Arc<dyn CachePool>,
    entry: CacheEntry,
    config: CacheStoreConfig,
    range_lock: RangeLock,
    stats: StoreStats,
}

impl<F: AsyncFile> CacheStore<F> {
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(
        file: F,
        pool: Arc<dyn CachePool>,
        entry: CacheEntry,
        config: CacheStoreConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            file,
            pool,
            entry,
            config,
            range_lock: RangeLock::new(),
            stats: StoreStats::new(),
        })
    }

    pub fn file(&self) -> &F {
        &self.file
    }

    pub fn entry(&self) -> &CacheEntry {
        &self.entry
    }

    pub fn config(&self) -> &CacheStoreConfig {
        &self.config
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    pub fn range_lock(&self) -> &RangeLock {
        &self.range_lock
    }

    // =========================================================================
    // Data Path
    // =========================================================================

    pub async fn preadv(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> Result<usize> {
        self.pool.update_recency(self.entry.handle());

        let start = Instant::now();
        let result = {
            let _shared = self.entry.lock().read().await;
            self.file.preadv(bufs, offset).await
        };
        self.audit("read", offset, &result, start.elapsed(), self.config.read_audit_threshold);

        let n = result.map_err(Error::from_io)?;
        self.stats.record_read(n);
        Ok(n)
    }

    pub async fn pread(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.preadv(&mut [IoSliceMut::new(buf)], offset).await
    }

    /// Write into the cache.
    ///
    /// Fails with [`Error::CacheFull`] without touching the file when the pool
    /// has no room. A device ENOSPC asks the pool to recycle and is still
    /// returned. Successful writes report the file's allocated size to the pool.
    pub async fn pwritev(&self, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
        if self.pool.is_full() {
            self.stats.record_rejected_full();
            debug!(entry = self.entry.handle().id(), offset, "cache full, write rejected");
            return Err(Error::CacheFull);
        }

        let size: u64 = bufs.iter().map(|b| b.len() as u64).sum();
        let start = Instant::now();
        let result = {
            let _range = self.range_lock.lock(offset, size).await;
            self.file.pwritev(bufs, offset).await
        };
        self.audit("write", offset, &result, start.elapsed(), self.config.write_audit_threshold);

        let n = match result {
            Ok(n) => n,
            Err(e) => {
                let err = Error::from_io(e);
                if err.is_no_space() {
                    warn!(entry = self.entry.handle().id(), offset, size, "device full, forcing recycle");
                    self.stats.record_forced_recycle();
                    self.pool.force_recycle();
                }
                return Err(err);
            }
        };

        if n > 0 {
            self.report_usage(true).await;
        }
        self.stats.record_write(n);
        Ok(n)
    }

    pub async fn pwrite(&self, buf: &[u8], offset: u64) -> Result<usize> {
        self.pwritev(&[IoSlice::new(buf)], offset).await
    }

    // =========================================================================
    // Refill / Evict
    // =========================================================================

    /// Part of `[offset, offset + size)` still to be fetched from origin.
    ///
    /// The window is aligned out to 4KB and held under the range lock while
    /// the extent map is read, so no write can change it mid-query.
    #[instrument(skip(self), fields(entry = self.entry.handle().id()))]
    pub async fn query_refill_range(&self, offset: u64, size: u64) -> Result<RefillRange> {
        let window_start = align_down(offset, REFILL_BLOCK_SIZE);
        let window_end = align_up(offset.saturating_add(size), REFILL_BLOCK_SIZE);
        let window_len = window_end - window_start;

        let _range = self.range_lock.lock(window_start, window_len).await;

        let mut extents = Vec::new();
        if window_len > 0 {
            let limit = self.config.max_extents;
            extents = self
                .file
                .fiemap(window_start, window_len, limit)
                .await
                .map_err(|source| {
                    error!(offset = window_start, size = window_len, "extent query failed: {}", source);
                    Error::ExtentQuery {
                        offset: window_start,
                        size: window_len,
                        source,
                    }
                })?;
            if extents.len() >= limit {
                error!(offset = window_start, size = window_len, limit, "too many extents in window");
                return Err(Error::TooManyExtents {
                    offset: window_start,
                    size: window_len,
                    limit,
                });
            }
        }

        let range = refill_range(window_start, window_end, &extents, self.config.refill_unit);
        self.stats.record_refill(range.is_cached());
        debug!(
            extents = extents.len(),
            refill_offset = range.offset,
            refill_len = range.len,
            "refill range"
        );
        Ok(range)
    }

    /// Drop cached data from `offset`.
    pub async fn evict(&self, offset: u64, span: EvictSpan) -> Result<()> {
        match span {
            EvictSpan::ToEnd => {
                let _range = self.range_lock.lock(offset, u64::MAX - offset).await;
                self.file.ftruncate(offset).await?;
            }
            EvictSpan::Len(len) => {
                let _range = self.range_lock.lock(offset, len).await;
                self.file
                    .fallocate(FallocateMode::PunchHole, offset, len)
                    .await?;
            }
        }
        debug!(entry = self.entry.handle().id(), offset, ?span, "evicted");
        self.report_usage(false).await;
        Ok(())
    }

    pub async fn fstat(&self) -> Result<FileStat> {
        Ok(self.file.fstat().await?)
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Tell the pool how much disk the file now occupies.
    async fn report_usage(&self, touch: bool) {
        let handle = self.entry.handle();
        match self.file.fstat().await {
            Ok(stat) => {
                if touch {
                    self.pool.update_recency(handle);
                }
                self.pool.update_space(handle, stat.disk_usage());
            }
            Err(e) => warn!(entry = handle.id(), "fstat failed, pool usage not updated: {}", e),
        }
    }

    fn audit(
        &self,
        op: &'static str,
        offset: u64,
        result: &io::Result<usize>,
        elapsed: Duration,
        threshold: Duration,
    ) {
        if elapsed < threshold {
            return;
        }
        self.stats.record_slow_op();
        let elapsed_us = elapsed.as_micros() as u64;
        let entry = self.entry.handle().id();
        match result {
            Ok(n) => info!(target: AUDIT_TARGET, op, entry, offset, bytes = *n, elapsed_us, "slow cache operation"),
            Err(e) => info!(target: AUDIT_TARGET, op, entry, offset, error = %e, elapsed_us, "slow cache operation"),
        }
    }
}

impl<F: AsyncFile> Drop for CacheStore<F> {
    fn drop(&mut self) {
        debug!(entry = self.entry.handle().id(), "closing cache store");
        self.pool.remove_open_file(self.entry.handle());
    }
}

impl<F: AsyncFile> std::fmt::Debug for CacheStore<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("entry", &self.entry)
            .field("config", &self.config)
            .field("range_lock", &self.range_lock)
            .finish_non_exhaustive()
    }
}

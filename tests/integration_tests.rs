//! rangecache Integration Tests
//!
//! End-to-end flows across the public API:
//! - Throttled cache store: admission, splitting and pool accounting together
//! - Byte-range write exclusion between concurrent writers
//! - Pool pressure: capacity rejection, forced recycle, reclaim by LRU
//! - Fill loop against real local files

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use rangecache::cache::{CachePool, CacheStore, EvictSpan, LruPool, RefillRange};
use rangecache::config::{CacheStoreConfig, ThrottleLimits, UpperLimits};
use rangecache::file::{AsyncFile, IoKind, LocalFile, MemoryFile};
use rangecache::throttle::ThrottledFile;
use rangecache::Error;

const KB: u64 = 1024;

fn store_config(refill_unit: u64) -> CacheStoreConfig {
    CacheStoreConfig {
        refill_unit,
        ..Default::default()
    }
}

// =============================================================================
// Throttled Cache Store
// =============================================================================

mod throttled_store_tests {
    use super::*;

    fn throttled_store(
        write: UpperLimits,
    ) -> (Arc<LruPool>, CacheStore<ThrottledFile<MemoryFile>>) {
        let limits = ThrottleLimits {
            write,
            ..Default::default()
        };
        let pool = Arc::new(LruPool::new(0));
        let entry = pool.open_entry("object");
        let file = ThrottledFile::new(MemoryFile::new(), limits);
        let store = CacheStore::new(file, pool.clone(), entry, store_config(16 * KB)).unwrap();
        (pool, store)
    }

    #[tokio::test]
    async fn test_store_write_is_split_and_accounted() {
        let (pool, store) = throttled_store(UpperLimits::unlimited().with_block_size(4096));

        assert_eq!(store.pwrite(&[5u8; 10_000], 0).await.unwrap(), 10_000);

        let writes: Vec<usize> = store
            .file()
            .inner()
            .io_log()
            .into_iter()
            .filter(|(kind, _, _)| *kind == IoKind::Write)
            .map(|(_, _, n)| n)
            .collect();
        assert_eq!(writes, vec![4096, 4096, 1808]);
        assert_eq!(pool.used(), 12 * KB);

        let io = store.file().stats().snapshot();
        assert_eq!(io.write.ops, 1);
        assert_eq!(io.write.bytes, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_then_fill_through_throttle() {
        let (_pool, store) = throttled_store(UpperLimits::unlimited().with_throughput(32 * 1024));

        let range = store.query_refill_range(0, 64 * KB).await.unwrap();
        assert_eq!(range, RefillRange { offset: 0, len: 64 * KB });

        let start = Instant::now();
        for chunk in 0..4u64 {
            store
                .pwrite(&[1u8; 16 * 1024], chunk * 16 * KB)
                .await
                .unwrap();
        }
        // 32KB/s: the third write ends 16KB over the limit (0.5s), and the
        // fourth lands while all 48KB are still draining (1s more)
        assert_eq!(start.elapsed(), Duration::from_millis(1500));
        assert!(store.query_refill_range(0, 64 * KB).await.unwrap().is_cached());
    }

    #[tokio::test]
    async fn test_device_full_mid_split_forces_recycle() {
        let limits = ThrottleLimits {
            write: UpperLimits::unlimited().with_block_size(4096),
            ..Default::default()
        };
        let pool = Arc::new(LruPool::new(0));
        let entry = pool.open_entry("object");
        let file = ThrottledFile::new(MemoryFile::with_quota(8 * KB), limits);
        let store = CacheStore::new(file, pool.clone(), entry, store_config(16 * KB)).unwrap();

        let err = store.pwrite(&[1u8; 16384], 0).await.unwrap_err();
        assert!(err.is_no_space());
        assert!(matches!(err, Error::PartialTransfer { transferred: 8192, .. }));

        assert_eq!(pool.recycle_requests(), 1);
        assert_eq!(store.stats().snapshot().forced_recycles, 1);
        assert_eq!(store.file().stats().snapshot().write.errors, 1);
    }

    #[tokio::test]
    async fn test_short_read_past_cached_data() {
        let (_pool, store) = throttled_store(UpperLimits::unlimited());
        store.pwrite(&[9u8; 100], 0).await.unwrap();

        let mut buf = [0u8; 4096];
        assert_eq!(store.pread(&mut buf, 0).await.unwrap(), 100);
    }
}

// =============================================================================
// Range Exclusion
// =============================================================================

mod range_lock_tests {
    use super::*;

    fn slow_store() -> Arc<CacheStore<MemoryFile>> {
        let file = MemoryFile::new();
        file.set_write_delay(Some(Duration::from_millis(10)));
        let pool = Arc::new(LruPool::new(0));
        let entry = pool.open_entry("object");
        Arc::new(CacheStore::new(file, pool, entry, store_config(4 * KB)).unwrap())
    }

    async fn timed_write(
        store: Arc<CacheStore<MemoryFile>>,
        fill: u8,
        offset: u64,
        done: Arc<Mutex<Vec<u8>>>,
    ) {
        store.pwrite(&[fill; 100], offset).await.unwrap();
        done.lock().push(fill);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_writers_run_concurrently() {
        let store = slow_store();
        let done = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let a = tokio::spawn(timed_write(store.clone(), 1, 0, done.clone()));
        let b = tokio::spawn(timed_write(store.clone(), 2, 200, done.clone()));
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(10));
        assert_eq!(done.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_writers_serialize_in_order() {
        let store = slow_store();
        let done = Arc::new(Mutex::new(Vec::new()));
        let start = Instant::now();

        let a = tokio::spawn(timed_write(store.clone(), 1, 0, done.clone()));
        tokio::task::yield_now().await;
        let b = tokio::spawn(timed_write(store.clone(), 2, 50, done.clone()));
        a.await.unwrap();
        b.await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert_eq!(*done.lock(), vec![1, 2]);

        let contents = store.file().contents();
        assert!(contents[..50].iter().all(|&b| b == 1));
        assert!(contents[50..150].iter().all(|&b| b == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reads_do_not_wait_for_writes() {
        let store = slow_store();
        store.file().set_write_delay(None);
        store.pwrite(&[3u8; 100], 0).await.unwrap();
        store.file().set_write_delay(Some(Duration::from_millis(10)));

        let writer = tokio::spawn({
            let store = store.clone();
            async move { store.pwrite(&[4u8; 100], 0).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(store.range_lock().held().len(), 1);

        let start = Instant::now();
        let mut buf = [0u8; 100];
        store.pread(&mut buf, 0).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        writer.await.unwrap().unwrap();
    }
}

// =============================================================================
// Pool Pressure
// =============================================================================

mod pool_tests {
    use super::*;

    #[tokio::test]
    async fn test_full_pool_then_reclaim_lru_entry() {
        let pool = Arc::new(LruPool::new(8 * KB));
        let old = CacheStore::new(
            MemoryFile::new(),
            pool.clone(),
            pool.open_entry("old"),
            store_config(4 * KB),
        ).unwrap();
        let new = CacheStore::new(
            MemoryFile::new(),
            pool.clone(),
            pool.open_entry("new"),
            store_config(4 * KB),
        ).unwrap();

        old.pwrite(&[1u8; 4096], 0).await.unwrap();
        new.pwrite(&[2u8; 4096], 0).await.unwrap();
        assert!(pool.is_full());

        let err = new.pwrite(&[2u8; 10], 4 * KB).await.unwrap_err();
        assert!(matches!(err, Error::CacheFull));

        // reclaimer: drop the least recently used entry's data
        let victim = pool.lru_order()[0];
        assert_eq!(victim, old.entry().handle());
        old.evict(0, EvictSpan::ToEnd).await.unwrap();
        assert_eq!(pool.used(), 4 * KB);

        assert_eq!(new.pwrite(&[2u8; 10], 4 * KB).await.unwrap(), 10);
        assert_eq!(pool.lru_order().last(), Some(&new.entry().handle()));
    }

    #[tokio::test]
    async fn test_device_full_wakes_reclaimer() {
        let pool = Arc::new(LruPool::new(0));
        let store = CacheStore::new(
            MemoryFile::with_quota(4 * KB),
            pool.clone(),
            pool.open_entry("object"),
            store_config(4 * KB),
        ).unwrap();
        store.pwrite(&[1u8; 4096], 0).await.unwrap();

        let reclaimer = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.recycle_requested().await;
                pool.lru_order()
            })
        };
        tokio::task::yield_now().await;

        let err = store.pwrite(&[1u8; 10], 4 * KB).await.unwrap_err();
        assert!(err.is_no_space());

        let order = reclaimer.await.unwrap();
        assert_eq!(order, vec![store.entry().handle()]);
        assert_eq!(store.stats().snapshot().forced_recycles, 1);
    }

    #[tokio::test]
    async fn test_closed_store_leaves_pool_entry() {
        let pool = Arc::new(LruPool::new(0));
        let handle = {
            let store = CacheStore::new(
                MemoryFile::new(),
                pool.clone(),
                pool.open_entry("object"),
                store_config(4 * KB),
            ).unwrap();
            store.pwrite(&[1u8; 10], 0).await.unwrap();
            store.entry().handle()
        };

        assert!(!pool.is_open(handle));
        assert_eq!(pool.entry_size(handle), Some(4 * KB));
        assert!(!pool.is_full());
    }
}

// =============================================================================
// Local Files
// =============================================================================

mod local_file_tests {
    use super::*;

    async fn fill_pass(
        origin: &LocalFile,
        store: &CacheStore<ThrottledFile<LocalFile>>,
        chunk: u64,
    ) -> (u64, u64) {
        let size = origin.fstat().await.unwrap().size;
        let mut fetched = 0u64;
        let mut skipped = 0u64;
        let mut offset = 0u64;
        while offset < size {
            let want = chunk.min(size - offset);
            let range = store.query_refill_range(offset, want).await.unwrap();
            offset += want;
            if range.is_cached() {
                skipped += 1;
                continue;
            }
            let end = range.end().min(size);
            let mut buf = vec![0u8; (end - range.offset) as usize];
            let n = origin.pread(&mut buf, range.offset).await.unwrap();
            fetched += store.pwrite(&buf[..n], range.offset).await.unwrap() as u64;
        }
        (fetched, skipped)
    }

    #[tokio::test]
    async fn test_fill_copies_once() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("source"), &data).unwrap();

        let origin = LocalFile::open_read_only(dir.path().join("source")).unwrap();
        let cache = LocalFile::create(dir.path().join("cache")).unwrap();
        let limits = ThrottleLimits {
            write: UpperLimits::unlimited().with_block_size(64 * 1024),
            ..Default::default()
        };
        let pool = Arc::new(LruPool::new(0));
        let entry = pool.open_entry("cache");
        let store = CacheStore::new(
            ThrottledFile::new(cache, limits),
            pool.clone(),
            entry,
            store_config(256 * KB),
        ).unwrap();

        let (fetched, skipped) = fill_pass(&origin, &store, 256 * KB).await;
        assert_eq!(fetched, data.len() as u64);
        assert_eq!(skipped, 0);

        let (fetched, skipped) = fill_pass(&origin, &store, 256 * KB).await;
        assert_eq!(fetched, 0);
        assert_eq!(skipped, 3);

        let copied = std::fs::read(dir.path().join("cache")).unwrap();
        assert_eq!(copied, data);
        assert!(pool.used() > 0);
    }

    #[tokio::test]
    async fn test_evict_to_end_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(LruPool::new(0));
        let store = CacheStore::new(
            LocalFile::create(dir.path().join("cache")).unwrap(),
            pool.clone(),
            pool.open_entry("cache"),
            store_config(4 * KB),
        ).unwrap();
        store.pwrite(&[1u8; 8192], 0).await.unwrap();

        store.evict(4096, EvictSpan::ToEnd).await.unwrap();
        assert_eq!(store.fstat().await.unwrap().size, 4096);
    }
}

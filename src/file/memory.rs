//! In-memory sparse file
//!
//! Storage is allocated in [`MEMORY_BLOCK_SIZE`] blocks on first write, so the
//! extent map and `blocks` count behave like a sparse file on a real
//! filesystem. `fallocate(Allocate)` creates unwritten blocks that read as
//! zeros and show up as [`ExtentFlags::UNWRITTEN`] until written.
//!
//! Faults can be injected for tests: a block quota that turns allocation
//! into ENOSPC, one-shot errors per operation class, and a per-write delay.

use std::collections::BTreeMap;
use std::io::{self, SeekFrom};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use super::{resolve_seek, AsyncFile, Extent, ExtentFlags, FallocateMode, FileStat, DISK_BLOCK_SIZE};

/// Allocation granularity of [`MemoryFile`] (4KB)
pub const MEMORY_BLOCK_SIZE: u64 = 4096;

#[derive(Debug)]
struct Block {
    data: BytesMut,
    unwritten: bool,
}

impl Block {
    fn zeroed(unwritten: bool) -> Self {
        Self {
            data: BytesMut::zeroed(MEMORY_BLOCK_SIZE as usize),
            unwritten,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    blocks: BTreeMap<u64, Block>,
    size: u64,
    pos: u64,
    quota_blocks: Option<u64>,
    read_error: Option<i32>,
    write_error: Option<i32>,
    fiemap_error: Option<i32>,
    io_log: Vec<(IoKind, u64, usize)>,
}

/// Kind of data transfer recorded in [`MemoryFile::io_log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    Read,
    Write,
}

impl Inner {
    fn allocate(&mut self, index: u64, unwritten: bool) -> io::Result<&mut Block> {
        if !self.blocks.contains_key(&index) {
            if let Some(quota) = self.quota_blocks {
                if self.blocks.len() as u64 >= quota {
                    return Err(io::Error::from_raw_os_error(libc::ENOSPC));
                }
            }
            self.blocks.insert(index, Block::zeroed(unwritten));
        }
        self.blocks
            .get_mut(&index)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EIO))
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if let Some(errno) = self.read_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let end = offset.saturating_add(buf.len() as u64).min(self.size);
        if offset >= end {
            self.io_log.push((IoKind::Read, offset, 0));
            return Ok(0);
        }
        let n = (end - offset) as usize;
        let mut done = 0usize;
        while done < n {
            let at = offset + done as u64;
            let index = at / MEMORY_BLOCK_SIZE;
            let within = (at % MEMORY_BLOCK_SIZE) as usize;
            let take = (MEMORY_BLOCK_SIZE as usize - within).min(n - done);
            match self.blocks.get(&index) {
                Some(block) if !block.unwritten => {
                    buf[done..done + take].copy_from_slice(&block.data[within..within + take]);
                }
                _ => buf[done..done + take].fill(0),
            }
            done += take;
        }
        self.io_log.push((IoKind::Read, offset, n));
        Ok(n)
    }

    fn write_at(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if let Some(errno) = self.write_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        let mut done = 0usize;
        while done < buf.len() {
            let at = offset + done as u64;
            let index = at / MEMORY_BLOCK_SIZE;
            let within = (at % MEMORY_BLOCK_SIZE) as usize;
            let take = (MEMORY_BLOCK_SIZE as usize - within).min(buf.len() - done);
            let block = match self.allocate(index, false) {
                Ok(block) => block,
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            };
            block.data[within..within + take].copy_from_slice(&buf[done..done + take]);
            block.unwritten = false;
            done += take;
        }
        self.size = self.size.max(offset + done as u64);
        self.io_log.push((IoKind::Write, offset, done));
        Ok(done)
    }

    fn punch_hole(&mut self, offset: u64, len: u64) {
        let end = offset.saturating_add(len);
        let first_full = offset.div_ceil(MEMORY_BLOCK_SIZE);
        let last_full = end / MEMORY_BLOCK_SIZE;
        let full: Vec<u64> = self
            .blocks
            .range(first_full..last_full)
            .map(|(index, _)| *index)
            .collect();
        for index in full {
            self.blocks.remove(&index);
        }
        // Partial blocks at either edge are zeroed in place.
        for at in [offset, end] {
            let index = at / MEMORY_BLOCK_SIZE;
            if index >= first_full && index < last_full {
                continue;
            }
            if let Some(block) = self.blocks.get_mut(&index) {
                let block_start = index * MEMORY_BLOCK_SIZE;
                let from = offset.max(block_start) - block_start;
                let to = end.min(block_start + MEMORY_BLOCK_SIZE) - block_start;
                if from < to {
                    block.data[from as usize..to as usize].fill(0);
                }
            }
        }
    }

    fn extents(&self, offset: u64, len: u64, max_extents: usize) -> Vec<Extent> {
        let end = offset.saturating_add(len);
        let mut runs: Vec<Extent> = Vec::new();
        for (index, block) in &self.blocks {
            let start = index * MEMORY_BLOCK_SIZE;
            let flags = if block.unwritten {
                ExtentFlags::UNWRITTEN
            } else {
                ExtentFlags::NONE
            };
            match runs.last_mut() {
                Some(run) if run.end() == start && run.flags == flags => {
                    run.length += MEMORY_BLOCK_SIZE;
                }
                _ => runs.push(Extent::new(start, MEMORY_BLOCK_SIZE).with_flags(flags)),
            }
        }
        if let Some(last) = runs.last_mut() {
            last.flags = last.flags | ExtentFlags::LAST;
        }
        runs.into_iter()
            .filter(|e| e.logical < end && e.end() > offset)
            .take(max_extents)
            .collect()
    }
}

/// In-memory sparse file.
#[derive(Debug, Default)]
pub struct MemoryFile {
    inner: Mutex<Inner>,
    write_delay: Mutex<Option<Duration>>,
}

impl MemoryFile {
    /// Create an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty file that fails allocations past `bytes` with ENOSPC.
    pub fn with_quota(bytes: u64) -> Self {
        let file = Self::new();
        file.inner.lock().quota_blocks = Some(bytes / MEMORY_BLOCK_SIZE);
        file
    }

    /// Create a file holding `data` from offset 0.
    pub fn with_contents(data: &[u8]) -> Self {
        let file = Self::new();
        if let Err(e) = file.inner.lock().write_at(data, 0) {
            tracing::warn!("MemoryFile::with_contents failed: {}", e);
        }
        file
    }

    /// Fail the next read with `errno`.
    pub fn fail_next_read(&self, errno: i32) {
        self.inner.lock().read_error = Some(errno);
    }

    /// Fail the next write with `errno`.
    pub fn fail_next_write(&self, errno: i32) {
        self.inner.lock().write_error = Some(errno);
    }

    /// Fail the next extent-map query with `errno`.
    pub fn fail_next_fiemap(&self, errno: i32) {
        self.inner.lock().fiemap_error = Some(errno);
    }

    /// Sleep this long inside every write, after data is copied in.
    pub fn set_write_delay(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Every transfer seen so far as `(kind, offset, bytes)`.
    pub fn io_log(&self) -> Vec<(IoKind, u64, usize)> {
        self.inner.lock().io_log.clone()
    }

    pub fn clear_io_log(&self) {
        self.inner.lock().io_log.clear();
    }

    /// Copy of the logical file contents.
    pub fn contents(&self) -> Bytes {
        let mut inner = self.inner.lock();
        let mut out = vec![0u8; inner.size as usize];
        let saved = inner.io_log.len();
        let _ = inner.read_at(&mut out, 0);
        inner.io_log.truncate(saved);
        Bytes::from(out)
    }

    /// Number of allocated blocks.
    pub fn allocated_blocks(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    async fn delay_write(&self) {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl AsyncFile for MemoryFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.inner.lock().read_at(buf, offset)
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let n = self.inner.lock().write_at(buf, offset)?;
        self.delay_write().await;
        Ok(n)
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        let n = inner.read_at(buf, pos)?;
        inner.pos += n as u64;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = {
            let mut inner = self.inner.lock();
            let pos = inner.pos;
            let n = inner.write_at(buf, pos)?;
            inner.pos += n as u64;
            n
        };
        self.delay_write().await;
        Ok(n)
    }

    async fn lseek(&self, pos: SeekFrom) -> io::Result<u64> {
        let mut inner = self.inner.lock();
        inner.pos = resolve_seek(pos, inner.pos, inner.size)?;
        Ok(inner.pos)
    }

    async fn fsync(&self) -> io::Result<()> {
        Ok(())
    }

    async fn fstat(&self) -> io::Result<FileStat> {
        let inner = self.inner.lock();
        Ok(FileStat {
            size: inner.size,
            blocks: inner.blocks.len() as u64 * (MEMORY_BLOCK_SIZE / DISK_BLOCK_SIZE),
        })
    }

    async fn ftruncate(&self, len: u64) -> io::Result<()> {
        let mut inner = self.inner.lock();
        if len < inner.size {
            let size = inner.size;
            inner.punch_hole(len, size - len);
        }
        inner.size = len;
        Ok(())
    }

    async fn fallocate(&self, mode: FallocateMode, offset: u64, len: u64) -> io::Result<()> {
        let mut inner = self.inner.lock();
        match mode {
            FallocateMode::Allocate => {
                let end = offset.saturating_add(len);
                let first = offset / MEMORY_BLOCK_SIZE;
                let last = end.div_ceil(MEMORY_BLOCK_SIZE);
                for index in first..last {
                    inner.allocate(index, true)?;
                }
                inner.size = inner.size.max(end);
            }
            FallocateMode::PunchHole => inner.punch_hole(offset, len),
        }
        Ok(())
    }

    async fn fiemap(&self, offset: u64, len: u64, max_extents: usize) -> io::Result<Vec<Extent>> {
        let mut inner = self.inner.lock();
        if let Some(errno) = inner.fiemap_error.take() {
            return Err(io::Error::from_raw_os_error(errno));
        }
        Ok(inner.extents(offset, len, max_extents))
    }
}

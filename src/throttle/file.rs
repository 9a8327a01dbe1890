use std::io::{self, IoSlice, IoSliceMut, SeekFrom};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;

use super::admission::Admission;
use super::tier::Tier;
use crate::config::ThrottleLimits;
use crate::error::Error;
use crate::file::{AsyncFile, Extent, FallocateMode, FileStat};
use crate::metrics::{Direction, IoStats};
use crate::split::{split_io, ChunkedIo, ScatterCursor};

/// File decorator enforcing [`ThrottleLimits`] on every data transfer.
///
/// Reads are charged to the `rw` and `read` tiers and split by
/// `read.block_size`; writes are charged to `rw` and `write` and split by
/// `write.block_size`. All other operations pass straight through.
#[derive(Debug)]
pub struct ThrottledFile<F> {
    inner: F,
    limits: ThrottleLimits,
    all: Tier,
    read: Tier,
    write: Tier,
    stats: IoStats,
}

impl<F: AsyncFile> ThrottledFile<F> {
    pub fn new(inner: F, limits: ThrottleLimits) -> Self {
        let window = limits.time_window();
        Self {
            all: Tier::new("rw", &limits.rw, window),
            read: Tier::new("read", &limits.read, window),
            write: Tier::new("write", &limits.write, window),
            inner,
            limits,
            stats: IoStats::new(),
        }
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }

    pub fn into_inner(self) -> F {
        self.inner
    }

    pub fn limits(&self) -> &ThrottleLimits {
        &self.limits
    }

    pub fn stats(&self) -> &IoStats {
        &self.stats
    }

    pub fn tier(&self, dir: Direction) -> &Tier {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Shared by both directions: admission, split transfer, settle.
    async fn throttled<S>(
        &self,
        dir: Direction,
        name: &'static str,
        count: usize,
        op: &mut S,
    ) -> io::Result<usize>
    where
        S: ChunkedIo,
    {
        let block_size = match dir {
            Direction::Read => self.limits.read.block_size,
            Direction::Write => self.limits.write.block_size,
        };
        let transfer = split_io(name, count, block_size, op);
        let (result, slept) = Admission::scoped(&self.all, self.tier(dir), count, transfer).await?;
        self.stats.record_throttled(dir, slept);

        match result {
            Ok(done) => {
                self.stats.record_transfer(dir, done.bytes, done.short);
                Ok(done.bytes)
            }
            // The device error wins; the bytes already moved travel inside it.
            Err(e) => {
                self.stats.record_error(dir);
                if let Error::PartialTransfer { transferred, .. } = &e {
                    self.stats.record_transfer(dir, *transferred, true);
                }
                Err(e.into())
            }
        }
    }
}

// =============================================================================
// Chunked Operations
// =============================================================================

struct ReadAt<'a, F> {
    file: &'a F,
    buf: &'a mut [u8],
    offset: Option<u64>,
    done: usize,
}

impl<F: AsyncFile> ChunkedIo for ReadAt<'_, F> {
    fn perform(&mut self, len: usize) -> BoxFuture<'_, io::Result<usize>> {
        let chunk = &mut self.buf[self.done..self.done + len];
        match self.offset {
            Some(offset) => self.file.pread(chunk, offset + self.done as u64),
            None => self.file.read(chunk),
        }
    }

    fn advance(&mut self, n: usize) {
        self.done += n;
    }
}

struct WriteAt<'a, F> {
    file: &'a F,
    buf: &'a [u8],
    offset: Option<u64>,
    done: usize,
}

impl<F: AsyncFile> ChunkedIo for WriteAt<'_, F> {
    fn perform(&mut self, len: usize) -> BoxFuture<'_, io::Result<usize>> {
        let chunk = &self.buf[self.done..self.done + len];
        match self.offset {
            Some(offset) => self.file.pwrite(chunk, offset + self.done as u64),
            None => self.file.write(chunk),
        }
    }

    fn advance(&mut self, n: usize) {
        self.done += n;
    }
}

struct VecReadAt<'a, 'b, F> {
    file: &'a F,
    bufs: &'a mut [IoSliceMut<'b>],
    cursor: ScatterCursor,
    offset: Option<u64>,
    done: usize,
}

impl<F: AsyncFile> ChunkedIo for VecReadAt<'_, '_, F> {
    fn perform(&mut self, len: usize) -> BoxFuture<'_, io::Result<usize>> {
        self.cursor.frame(len);
        let mut slices = self.cursor.slices_mut(self.bufs);
        let file = self.file;
        let offset = self.offset.map(|o| o + self.done as u64);
        async move {
            match offset {
                Some(offset) => file.preadv(&mut slices, offset).await,
                None => file.readv(&mut slices).await,
            }
        }
        .boxed()
    }

    fn advance(&mut self, n: usize) {
        self.cursor.advance(n);
        self.done += n;
    }
}

struct VecWriteAt<'a, 'b, F> {
    file: &'a F,
    bufs: &'a [IoSlice<'b>],
    cursor: ScatterCursor,
    offset: Option<u64>,
    done: usize,
}

impl<F: AsyncFile> ChunkedIo for VecWriteAt<'_, '_, F> {
    fn perform(&mut self, len: usize) -> BoxFuture<'_, io::Result<usize>> {
        self.cursor.frame(len);
        let slices = self.cursor.slices(self.bufs);
        let file = self.file;
        let offset = self.offset.map(|o| o + self.done as u64);
        async move {
            match offset {
                Some(offset) => file.pwritev(&slices, offset).await,
                None => file.writev(&slices).await,
            }
        }
        .boxed()
    }

    fn advance(&mut self, n: usize) {
        self.cursor.advance(n);
        self.done += n;
    }
}

// =============================================================================
// File Interface
// =============================================================================

#[async_trait]
impl<F: AsyncFile> AsyncFile for ThrottledFile<F> {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let count = buf.len();
        let mut op = ReadAt {
            file: &self.inner,
            buf,
            offset: Some(offset),
            done: 0,
        };
        self.throttled(Direction::Read, "pread", count, &mut op).await
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut op = WriteAt {
            file: &self.inner,
            buf,
            offset: Some(offset),
            done: 0,
        };
        self.throttled(Direction::Write, "pwrite", buf.len(), &mut op).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len();
        let mut op = ReadAt {
            file: &self.inner,
            buf,
            offset: None,
            done: 0,
        };
        self.throttled(Direction::Read, "read", count, &mut op).await
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut op = WriteAt {
            file: &self.inner,
            buf,
            offset: None,
            done: 0,
        };
        self.throttled(Direction::Write, "write", buf.len(), &mut op).await
    }

    async fn preadv(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
        let cursor = ScatterCursor::for_slices_mut(bufs);
        let count = cursor.total();
        let mut op = VecReadAt {
            file: &self.inner,
            bufs,
            cursor,
            offset: Some(offset),
            done: 0,
        };
        self.throttled(Direction::Read, "preadv", count, &mut op).await
    }

    async fn pwritev(&self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        let cursor = ScatterCursor::for_slices(bufs);
        let count = cursor.total();
        let mut op = VecWriteAt {
            file: &self.inner,
            bufs,
            cursor,
            offset: Some(offset),
            done: 0,
        };
        self.throttled(Direction::Write, "pwritev", count, &mut op).await
    }

    async fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let cursor = ScatterCursor::for_slices_mut(bufs);
        let count = cursor.total();
        let mut op = VecReadAt {
            file: &self.inner,
            bufs,
            cursor,
            offset: None,
            done: 0,
        };
        self.throttled(Direction::Read, "readv", count, &mut op).await
    }

    async fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let cursor = ScatterCursor::for_slices(bufs);
        let count = cursor.total();
        let mut op = VecWriteAt {
            file: &self.inner,
            bufs,
            cursor,
            offset: None,
            done: 0,
        };
        self.throttled(Direction::Write, "writev", count, &mut op).await
    }

    async fn lseek(&self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.lseek(pos).await
    }

    async fn fsync(&self) -> io::Result<()> {
        self.inner.fsync().await
    }

    async fn fstat(&self) -> io::Result<FileStat> {
        self.inner.fstat().await
    }

    async fn ftruncate(&self, len: u64) -> io::Result<()> {
        self.inner.ftruncate(len).await
    }

    async fn fallocate(&self, mode: FallocateMode, offset: u64, len: u64) -> io::Result<()> {
        self.inner.fallocate(mode, offset, len).await
    }

    async fn fiemap(&self, offset: u64, len: u64, max_extents: usize) -> io::Result<Vec<Extent>> {
        self.inner.fiemap(offset, len, max_extents).await
    }
}

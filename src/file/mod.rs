//! File Interface
//!
//! The positioned / vectored file contract that the throttle decorator and the
//! cache store are written against, plus two implementations:
//!
//! - [`LocalFile`] - a real file on the local disk
//! - [`MemoryFile`] - an in-memory sparse file with fault injection
//!
//! # Extent Map
//!
//! [`AsyncFile::fiemap`] reports the allocated regions of a sparse file that
//! intersect a window. Extents flagged [`ExtentFlags::UNKNOWN`] or
//! [`ExtentFlags::UNWRITTEN`] are placeholders: space may be reserved but no
//! data has been written there yet.

use std::io::{self, IoSlice, IoSliceMut, SeekFrom};
use std::ops::BitOr;

use async_trait::async_trait;
use serde::Serialize;

mod local;
mod memory;

pub use local::LocalFile;
pub use memory::{IoKind, MemoryFile, MEMORY_BLOCK_SIZE};

/// Unit of `FileStat::blocks`, as reported by stat(2)
pub const DISK_BLOCK_SIZE: u64 = 512;

// =============================================================================
// Value Types
// =============================================================================

/// Subset of stat(2) the cache layer needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FileStat {
    /// Logical file size in bytes
    pub size: u64,
    /// Allocated 512-byte blocks
    pub blocks: u64,
}

impl FileStat {
    /// Bytes actually allocated on disk.
    pub fn disk_usage(&self) -> u64 {
        self.blocks * DISK_BLOCK_SIZE
    }
}

/// Flags attached to an [`Extent`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ExtentFlags(u32);

impl ExtentFlags {
    pub const NONE: ExtentFlags = ExtentFlags(0);
    /// Last extent of the file
    pub const LAST: ExtentFlags = ExtentFlags(0x0001);
    /// Location not yet known
    pub const UNKNOWN: ExtentFlags = ExtentFlags(0x0002);
    /// Space allocated but never written
    pub const UNWRITTEN: ExtentFlags = ExtentFlags(0x0800);

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: ExtentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// True when the extent holds no real data.
    pub fn is_placeholder(&self) -> bool {
        self.contains(Self::UNKNOWN) || self.contains(Self::UNWRITTEN)
    }
}

impl BitOr for ExtentFlags {
    type Output = ExtentFlags;

    fn bitor(self, rhs: Self) -> Self {
        ExtentFlags(self.0 | rhs.0)
    }
}

/// A contiguous allocated region of a sparse file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub logical: u64,
    pub length: u64,
    pub flags: ExtentFlags,
}

impl Extent {
    pub fn new(logical: u64, length: u64) -> Self {
        Self {
            logical,
            length,
            flags: ExtentFlags::NONE,
        }
    }

    pub fn with_flags(mut self, flags: ExtentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// First byte past the extent.
    pub fn end(&self) -> u64 {
        self.logical + self.length
    }
}

/// Operation requested from [`AsyncFile::fallocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallocateMode {
    /// Reserve space; the file grows if the range passes EOF
    Allocate,
    /// Deallocate the range, keeping the file size
    PunchHole,
}

// =============================================================================
// File Port
// =============================================================================

/// Positioned and vectored file I/O.
///
/// Short counts are not errors: a read returning fewer bytes than asked
/// reached end of file. Unpositioned operations use and advance a file
/// position owned by the implementation.
#[async_trait]
pub trait AsyncFile: Send + Sync {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    async fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write(&self, buf: &[u8]) -> io::Result<usize>;

    async fn preadv(&self, bufs: &mut [IoSliceMut<'_>], offset: u64) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs.iter_mut() {
            let want = buf.len();
            match self.pread(&mut buf[..], offset + done as u64).await {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    async fn pwritev(&self, bufs: &[IoSlice<'_>], offset: u64) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs {
            let want = buf.len();
            match self.pwrite(&buf[..], offset + done as u64).await {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    async fn readv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs.iter_mut() {
            let want = buf.len();
            match self.read(&mut buf[..]).await {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    async fn writev(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let mut done = 0usize;
        for buf in bufs {
            let want = buf.len();
            match self.write(&buf[..]).await {
                Ok(n) => {
                    done += n;
                    if n < want {
                        break;
                    }
                }
                Err(e) if done == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(done)
    }

    async fn lseek(&self, pos: SeekFrom) -> io::Result<u64>;

    async fn fsync(&self) -> io::Result<()>;

    async fn fstat(&self) -> io::Result<FileStat>;

    async fn ftruncate(&self, len: u64) -> io::Result<()>;

    async fn fallocate(&self, mode: FallocateMode, offset: u64, len: u64) -> io::Result<()>;

    /// Extents intersecting `[offset, offset + len)`, ascending, at most `max_extents`.
    async fn fiemap(&self, offset: u64, len: u64, max_extents: usize) -> io::Result<Vec<Extent>>;
}

/// Resolve a seek against the current position and file size.
pub(crate) fn resolve_seek(pos: SeekFrom, current: u64, size: u64) -> io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(n) => Some(n),
        SeekFrom::Current(d) => current.checked_add_signed(d),
        SeekFrom::End(d) => size.checked_add_signed(d),
    };
    target.ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_flags() {
        assert!(!ExtentFlags::NONE.is_placeholder());
        assert!(!ExtentFlags::LAST.is_placeholder());
        assert!(ExtentFlags::UNKNOWN.is_placeholder());
        assert!((ExtentFlags::UNWRITTEN | ExtentFlags::LAST).is_placeholder());
    }

    #[test]
    fn test_disk_usage() {
        let stat = FileStat {
            size: 100,
            blocks: 8,
        };
        assert_eq!(stat.disk_usage(), 4096);
    }

    #[test]
    fn test_resolve_seek() {
        assert_eq!(resolve_seek(SeekFrom::Start(7), 3, 10).unwrap(), 7);
        assert_eq!(resolve_seek(SeekFrom::Current(-2), 3, 10).unwrap(), 1);
        assert_eq!(resolve_seek(SeekFrom::End(5), 3, 10).unwrap(), 15);
        assert!(resolve_seek(SeekFrom::Current(-4), 3, 10).is_err());
    }
}

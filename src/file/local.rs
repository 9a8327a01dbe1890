//! Local disk file using `pread`/`pwrite` style I/O.
//!
//! Extent maps come from `SEEK_DATA`/`SEEK_HOLE`, and hole punching uses
//! fallocate(2). Both are Linux-only; elsewhere the file reports one data
//! extent up to EOF and `fallocate` fails with `Unsupported`.
//!
//! Every syscall runs on tokio's blocking pool so a slow disk never stalls a
//! runtime worker. Data is staged through an owned buffer on the way, which
//! costs one copy per transfer.

use std::fs::{File, OpenOptions};
use std::io::{self, SeekFrom};
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{resolve_seek, AsyncFile, Extent, FallocateMode, FileStat};

/// A file on the local disk.
#[derive(Debug)]
pub struct LocalFile {
    file: Arc<File>,
    path: PathBuf,
    // held across the transfer so unpositioned calls see a consistent offset
    pos: Mutex<u64>,
}

impl LocalFile {
    /// Open an existing file read-write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, path))
    }

    /// Open read-only.
    pub fn open_read_only(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Ok(Self::from_file(file, path))
    }

    /// Open read-write, creating the file if missing.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;
        Ok(Self::from_file(file, path))
    }

    fn from_file(file: File, path: impl AsRef<Path>) -> Self {
        Self {
            file: Arc::new(file),
            path: path.as_ref().to_path_buf(),
            pos: Mutex::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `op` against the file on the blocking pool.
    async fn blocking<T, Op>(&self, op: Op) -> io::Result<T>
    where
        T: Send + 'static,
        Op: FnOnce(&File) -> io::Result<T> + Send + 'static,
    {
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| io::Error::other(format!("blocking file task failed: {e}")))?
    }
}

#[cfg(target_os = "linux")]
fn seek_raw(file: &File, offset: u64, whence: libc::c_int) -> io::Result<Option<u64>> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: lseek on a descriptor we own; it only moves the kernel file
    // offset, which this type never relies on (all I/O is positioned).
    let ret = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENXIO) {
            return Ok(None);
        }
        return Err(err);
    }
    Ok(Some(ret as u64))
}

#[async_trait]
impl AsyncFile for LocalFile {
    async fn pread(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = buf.len();
        let (data, n) = self
            .blocking(move |f| {
                let mut data = vec![0u8; len];
                let n = f.read_at(&mut data, offset)?;
                Ok((data, n))
            })
            .await?;
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    async fn pwrite(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let data = buf.to_vec();
        self.blocking(move |f| f.write_at(&data, offset)).await
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pos = self.pos.lock().await;
        let n = self.pread(buf, *pos).await?;
        *pos += n as u64;
        Ok(n)
    }

    async fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut pos = self.pos.lock().await;
        let n = self.pwrite(buf, *pos).await?;
        *pos += n as u64;
        Ok(n)
    }

    async fn lseek(&self, pos: SeekFrom) -> io::Result<u64> {
        let mut current = self.pos.lock().await;
        let size = self.blocking(|f| Ok(f.metadata()?.len())).await?;
        *current = resolve_seek(pos, *current, size)?;
        Ok(*current)
    }

    async fn fsync(&self) -> io::Result<()> {
        self.blocking(|f| f.sync_all()).await
    }

    async fn fstat(&self) -> io::Result<FileStat> {
        self.blocking(|f| {
            let meta = f.metadata()?;
            Ok(FileStat {
                size: meta.len(),
                blocks: meta.blocks(),
            })
        })
        .await
    }

    async fn ftruncate(&self, len: u64) -> io::Result<()> {
        self.blocking(move |f| f.set_len(len)).await
    }

    #[cfg(target_os = "linux")]
    async fn fallocate(&self, mode: FallocateMode, offset: u64, len: u64) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;

        let flags = match mode {
            FallocateMode::Allocate => 0,
            FallocateMode::PunchHole => libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
        };
        self.blocking(move |f| {
            // SAFETY: plain syscall on an owned descriptor with scalar arguments.
            let ret = unsafe {
                libc::fallocate(f.as_raw_fd(), flags, offset as libc::off_t, len as libc::off_t)
            };
            if ret != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        })
        .await
    }

    #[cfg(not(target_os = "linux"))]
    async fn fallocate(&self, _mode: FallocateMode, _offset: u64, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fallocate is only available on Linux",
        ))
    }

    #[cfg(target_os = "linux")]
    async fn fiemap(&self, offset: u64, len: u64, max_extents: usize) -> io::Result<Vec<Extent>> {
        self.blocking(move |f| {
            let end = offset.saturating_add(len);
            let mut extents = Vec::new();
            let mut pos = offset;

            while pos < end && extents.len() < max_extents {
                let Some(data) = seek_raw(f, pos, libc::SEEK_DATA)? else {
                    break;
                };
                if data >= end {
                    break;
                }
                let hole = seek_raw(f, data, libc::SEEK_HOLE)?.unwrap_or(end);
                extents.push(Extent::new(data, hole - data));
                pos = hole;
            }
            Ok(extents)
        })
        .await
    }

    #[cfg(not(target_os = "linux"))]
    async fn fiemap(&self, offset: u64, len: u64, max_extents: usize) -> io::Result<Vec<Extent>> {
        let size = self.blocking(|f| Ok(f.metadata()?.len())).await?;
        let end = offset.saturating_add(len).min(size);
        if offset >= end || max_extents == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![Extent::new(offset, end - offset)])
    }
}

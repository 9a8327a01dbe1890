//! Block-Splitting I/O Driver
//!
//! Breaks one large transfer into calls no larger than a block-size ceiling.
//! The caller describes the transfer as a [`ChunkedIo`]: a per-chunk operation
//! plus a cursor-advance step. [`ScatterCursor`] is the cursor for vectored
//! buffers.
//!
//! A chunk that moves fewer bytes than requested ends the transfer: it is
//! reported as a short count, never retried. A device error ends it too and
//! carries the bytes already moved.

mod cursor;

pub use cursor::{IoSegment, ScatterCursor};

use std::io;

use futures::future::BoxFuture;
use tracing::{error, warn};

use crate::error::{Error, Result};

/// Outcome of a split transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transferred {
    /// Bytes moved in total
    pub bytes: usize,
    /// The backing file returned fewer bytes than asked (end of data)
    pub short: bool,
}

/// One resumable transfer driven by [`split_io`].
pub trait ChunkedIo: Send {
    /// Transfer up to `len` bytes at the current position.
    fn perform(&mut self, len: usize) -> BoxFuture<'_, io::Result<usize>>;

    /// Move the current position forward by `n` bytes.
    fn advance(&mut self, n: usize);
}

/// Run `op` over `count` bytes in chunks of at most `block_size`.
///
/// `block_size == 0` or `count <= block_size` makes a single unsplit call.
/// The op is advanced by each full chunk's length before the next chunk.
pub async fn split_io<S>(
    name: &'static str,
    count: usize,
    block_size: usize,
    op: &mut S,
) -> Result<Transferred>
where
    S: ChunkedIo + ?Sized,
{
    if block_size == 0 || count <= block_size {
        let n = op.perform(count).await?;
        return Ok(Transferred {
            bytes: n,
            short: n < count,
        });
    }

    let mut done = 0usize;
    while done < count {
        let len = (count - done).min(block_size);
        match op.perform(len).await {
            Ok(n) if n < len => {
                warn!(
                    op = name,
                    requested = len,
                    transferred = n,
                    total = done + n,
                    "short transfer, EOF?"
                );
                return Ok(Transferred {
                    bytes: done + n,
                    short: true,
                });
            }
            Ok(n) => {
                done += n;
                if done < count {
                    op.advance(n);
                }
            }
            Err(e) => {
                error!(op = name, offset = done, requested = len, "split transfer failed: {}", e);
                if done == 0 {
                    return Err(Error::Io(e));
                }
                return Err(Error::PartialTransfer {
                    transferred: done,
                    source: e,
                });
            }
        }
    }

    Ok(Transferred {
        bytes: done,
        short: false,
    })
}

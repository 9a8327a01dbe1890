use std::io::{IoSlice, IoSliceMut};

/// A window into one caller buffer: `len` bytes of buffer `index` from `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoSegment {
    pub index: usize,
    pub start: usize,
    pub len: usize,
}

/// Cursor over a scattered buffer for block-split transfers.
///
/// The cursor keeps its own copy of the segment shapes. Each chunk is framed
/// as a list of [`IoSegment`]s whose boundary entries are trimmed to the chunk;
/// the caller's `IoSlice`s are only borrowed when building a chunk's slices.
#[derive(Debug, Clone)]
pub struct ScatterCursor {
    lens: Vec<usize>,
    view: Vec<IoSegment>,
    // first segment not fully consumed, and bytes consumed from it
    seg: usize,
    skip: usize,
    remaining: usize,
    total: usize,
}

impl ScatterCursor {
    pub fn new(lens: impl IntoIterator<Item = usize>) -> Self {
        let lens: Vec<usize> = lens.into_iter().collect();
        let total = lens.iter().sum();
        Self {
            lens,
            view: Vec::new(),
            seg: 0,
            skip: 0,
            remaining: total,
            total,
        }
    }

    pub fn for_slices(bufs: &[IoSlice<'_>]) -> Self {
        Self::new(bufs.iter().map(|b| b.len()))
    }

    pub fn for_slices_mut(bufs: &[IoSliceMut<'_>]) -> Self {
        Self::new(bufs.iter().map(|b| b.len()))
    }

    /// Total bytes across all segments.
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes not yet consumed by `advance`.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Frame the next chunk of up to `len` bytes starting at the cursor.
    pub fn frame(&mut self, len: usize) -> &[IoSegment] {
        self.view.clear();
        let mut want = len.min(self.remaining);
        let mut index = self.seg;
        let mut start = self.skip;
        while want > 0 && index < self.lens.len() {
            let take = (self.lens[index] - start).min(want);
            if take > 0 {
                self.view.push(IoSegment { index, start, len: take });
            }
            want -= take;
            index += 1;
            start = 0;
        }
        &self.view
    }

    /// The most recently framed chunk.
    pub fn view(&self) -> &[IoSegment] {
        &self.view
    }

    /// Consume `n` bytes from the front.
    pub fn advance(&mut self, n: usize) {
        let mut n = n.min(self.remaining);
        self.remaining -= n;
        while n > 0 && self.seg < self.lens.len() {
            let left = self.lens[self.seg] - self.skip;
            if n < left {
                self.skip += n;
                break;
            }
            n -= left;
            self.seg += 1;
            self.skip = 0;
        }
        // step over empty segments so the next frame starts on data
        while self.seg < self.lens.len() && self.lens[self.seg] == self.skip {
            self.seg += 1;
            self.skip = 0;
        }
        self.view.clear();
    }

    /// Slices of `bufs` covering the framed chunk.
    pub fn slices<'a>(&self, bufs: &'a [IoSlice<'_>]) -> Vec<IoSlice<'a>> {
        self.view
            .iter()
            .map(|s| IoSlice::new(&bufs[s.index][s.start..s.start + s.len]))
            .collect()
    }

    /// Mutable slices of `bufs` covering the framed chunk.
    pub fn slices_mut<'a>(&self, bufs: &'a mut [IoSliceMut<'_>]) -> Vec<IoSliceMut<'a>> {
        let mut out = Vec::with_capacity(self.view.len());
        let mut segments = self.view.iter().peekable();
        for (index, buf) in bufs.iter_mut().enumerate() {
            let Some(seg) = segments.peek() else {
                break;
            };
            if seg.index != index {
                continue;
            }
            out.push(IoSliceMut::new(&mut buf[seg.start..seg.start + seg.len]));
            segments.next();
        }
        out
    }
}

//! Sequential read/write view over a segment store.

use mediacache_common::{CacheError, Result};
use tracing::{debug, trace};

use crate::store::SegmentStore;

/// Access mode for a stream cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorMode {
    /// Reads only; writes are rejected.
    Read,
    /// Reads and writes from position zero.
    ReadWrite,
    /// Reads and writes; the write position starts at the end of the last
    /// segment's content.
    Append,
}

/// A thin sequential wrapper over a [`SegmentStore`], tracking independent
/// read and write positions for one caller.
///
/// End of stream is defined against the store's optimistic full range, not
/// any declared total length: the true length may be unknown until the
/// download completes.
pub struct StreamCursor<'a> {
    store: &'a mut SegmentStore,
    read_pos: u64,
    write_pos: u64,
    read_only: bool,
}

impl SegmentStore {
    /// Opens a sequential cursor over this store.
    pub fn cursor(&mut self, mode: CursorMode) -> StreamCursor<'_> {
        let write_pos = match mode {
            CursorMode::Append => self.segments().last().map_or(0, |seg| seg.content_end()),
            _ => 0,
        };

        StreamCursor {
            store: self,
            read_pos: 0,
            write_pos,
            read_only: mode == CursorMode::Read,
        }
    }
}

impl StreamCursor<'_> {
    /// Current read position.
    pub fn read_position(&self) -> u64 {
        self.read_pos
    }

    /// Moves the read position.
    pub fn set_read_position(&mut self, pos: u64) {
        trace!(pos, "read position set");
        self.read_pos = pos;
    }

    /// Current write position.
    pub fn write_position(&self) -> u64 {
        self.write_pos
    }

    /// Moves the write position.
    pub fn set_write_position(&mut self, pos: u64) {
        trace!(pos, "write position set");
        self.write_pos = pos;
    }

    /// Writes all of `data` at the write position and advances it.
    ///
    /// A store that accepts fewer bytes than offered fails the whole
    /// write; sequential callers have no use for a partial tail.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(CacheError::Unsupported(
                "cursor is read-only".to_string(),
            ));
        }

        let written = self.store.write_content(self.write_pos, data)?;

        if written != data.len() {
            debug!(
                written,
                requested = data.len(),
                position = self.write_pos,
                "short write"
            );
            return Err(CacheError::OutOfRange(format!(
                "wrote {} of {} bytes at position {}",
                written,
                data.len(),
                self.write_pos
            )));
        }

        trace!(written, position = self.write_pos, "wrote bytes");
        self.write_pos += written as u64;

        Ok(())
    }

    /// Reads up to `buf.len()` bytes at the read position, crossing into
    /// adjoining segments as needed, and advances the position by the
    /// bytes actually read. A position nothing covers yields a short (or
    /// zero) read rather than an error.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut total = 0usize;

        while total < buf.len() {
            match self.store.read_content(self.read_pos + total as u64, &mut buf[total..]) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(CacheError::NotCached { .. }) => break,
                Err(err) => {
                    if total == 0 {
                        return Err(err);
                    }
                    break;
                }
            }
        }

        trace!(total, position = self.read_pos, "read bytes");
        self.read_pos += total as u64;

        Ok(total)
    }

    /// True once the read position has passed the optimistic full range.
    pub fn eof(&self) -> bool {
        self.read_pos >= self.store.optimistic_full_range().end()
    }

    /// Container length minus header and directory.
    pub fn content_length(&mut self) -> Result<u64> {
        self.store.content_region_len()
    }
}

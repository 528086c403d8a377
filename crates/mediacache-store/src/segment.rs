//! Segment records: one contiguous covered byte range of the resource.

use bytes::{Buf, BufMut, BytesMut};
use mediacache_common::{CacheError, Result};

use crate::format::{HeaderFlags, SegmentFlags};

/// One contiguous stored byte range, with its physical location in the
/// backing container and its status flags.
///
/// `empty_space` counts trailing bytes physically reserved after
/// `content_length` that hold no valid forward content; it is only
/// non-zero while streaming. `reserve` is an index handle into the owning
/// store's segment vector, set once bytes have been consumed from this
/// segment's front.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Physical byte offset in the backing store where content begins.
    pub(crate) file_offset: u64,
    /// Logical position of the first byte this segment holds.
    pub(crate) content_start: u64,
    /// Number of valid content bytes.
    pub(crate) content_length: u64,
    /// Trailing reserved-but-empty bytes after the content.
    pub(crate) empty_space: u64,
    /// Persisted status flags.
    pub(crate) flags: SegmentFlags,
    /// Index of the paired reserve segment, present once dirty.
    pub(crate) reserve: Option<usize>,
    /// Loaded dirty remnant of an interrupted streaming session; kept for
    /// layout accounting but invisible to coverage queries.
    pub(crate) discarded: bool,
}

impl Segment {
    /// Creates a new segment.
    pub fn new(file_offset: u64, content_start: u64, content_length: u64, flags: SegmentFlags) -> Self {
        Self {
            file_offset,
            content_start,
            content_length,
            empty_space: 0,
            flags,
            reserve: None,
            discarded: false,
        }
    }

    /// Logical position of the first byte this segment holds.
    pub fn content_start(&self) -> u64 {
        self.content_start
    }

    /// Number of valid content bytes.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// First logical position past the segment's content.
    pub fn content_end(&self) -> u64 {
        self.content_start + self.content_length
    }

    /// Physical offset of the segment's content in the backing store.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Content bytes plus trailing empty space.
    pub fn full_span(&self) -> u64 {
        self.content_length + self.empty_space
    }

    /// Returns true if this segment is the open, still-growing one.
    pub fn is_new(&self) -> bool {
        self.flags.is_new()
    }

    /// Returns true if bytes have been consumed from this segment's front.
    pub fn is_dirty(&self) -> bool {
        self.flags.is_dirty()
    }

    /// Checks whether `pos` is the first unread byte of this segment's
    /// range; returns the bytes available from there and the physical
    /// position to read from.
    pub fn contains_content_beginning(&self, pos: u64) -> Option<(u64, u64)> {
        if pos >= self.content_start && pos < self.content_end() {
            let bytes_available = self.content_end() - pos;
            let file_pos = self.file_offset + (pos - self.content_start);
            Some((bytes_available, file_pos))
        } else {
            None
        }
    }

    /// Checks whether this segment overlaps the requested window at all;
    /// returns the overlapping sub-range and its physical position.
    /// A `None` length means "through the end of the resource".
    pub fn contains_partial_content(
        &self,
        requested_start: u64,
        requested_len: Option<u64>,
    ) -> Option<(u64, u64, u64)> {
        if self.content_length == 0 || requested_len == Some(0) {
            return None;
        }

        let requested_end = match requested_len {
            None => {
                if requested_start >= self.content_end() {
                    return None;
                }
                self.content_end()
            }
            Some(len) => requested_start + len,
        };

        if requested_end <= self.content_start || requested_start >= self.content_end() {
            return None;
        }

        let start = requested_start.max(self.content_start);
        let end = requested_end.min(self.content_end());
        let file_pos = self.file_offset + (start - self.content_start);

        Some((start, end - start, file_pos))
    }

    /// Checks whether `pos` is the byte immediately following this
    /// segment's content; returns the physical append position.
    pub fn can_append_content(&self, pos: u64) -> Option<u64> {
        if pos == self.content_end() {
            Some(self.file_offset + self.content_length)
        } else {
            None
        }
    }

    /// Grows the content by `size` bytes, consuming trailing empty space
    /// first. Returns the number of new container bytes required beyond
    /// the existing empty space.
    pub fn add_content(&mut self, size: u64) -> u64 {
        self.content_length += size;

        if size > self.empty_space {
            let extension = size - self.empty_space;
            self.empty_space = 0;
            extension
        } else {
            self.empty_space -= size;
            0
        }
    }

    /// Drops bytes from the true front of the segment: everything before
    /// `pos` plus the next `bytes_to_consume` bytes. Advances the content
    /// start and physical offset accordingly and returns the number of
    /// bytes dumped; the caller credits them to the reserve's empty space.
    pub fn consume_front(&mut self, pos: u64, bytes_to_consume: u64) -> Result<u64> {
        if pos < self.content_start || pos >= self.content_end() {
            return Err(CacheError::OutOfRange(format!(
                "consume position {} outside segment [{}, {})",
                pos,
                self.content_start,
                self.content_end()
            )));
        }
        if pos + bytes_to_consume > self.content_end() {
            return Err(CacheError::OutOfRange(format!(
                "consume of {} bytes at {} overruns segment end {}",
                bytes_to_consume,
                pos,
                self.content_end()
            )));
        }

        let dumped = (pos - self.content_start) + bytes_to_consume;
        self.content_start += dumped;
        self.file_offset += dumped;
        self.content_length -= dumped;

        Ok(dumped)
    }
}

/// One persisted directory slot: `(content_start, content_length, flags)`.
///
/// A record with zero length and no flags is an unused slot; zero length
/// with the new flag set marks a crash during an append, whose true
/// length is recovered from the container length at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryRecord {
    pub content_start: u64,
    pub content_length: u64,
    pub flags: SegmentFlags,
}

impl DirectoryRecord {
    /// An unused slot.
    pub const EMPTY: DirectoryRecord = DirectoryRecord {
        content_start: 0,
        content_length: 0,
        flags: SegmentFlags::empty(),
    };

    /// Serializes the record per the header's field width.
    pub fn to_bytes(&self, header_flags: HeaderFlags) -> BytesMut {
        let mut buf = BytesMut::with_capacity(header_flags.record_size() as usize);

        if header_flags.is_wide() {
            buf.put_u64_le(self.content_start);
            buf.put_u64_le(self.content_length);
        } else {
            buf.put_u32_le(self.content_start as u32);
            buf.put_u32_le(self.content_length as u32);
        }
        buf.put_u8(self.flags.0);

        buf
    }

    /// Deserializes a record per the header's field width.
    pub fn from_bytes(mut data: &[u8], header_flags: HeaderFlags) -> Result<Self> {
        if (data.len() as u64) < header_flags.record_size() {
            return Err(CacheError::Corrupt("directory record too short".to_string()));
        }

        let (content_start, content_length) = if header_flags.is_wide() {
            (data.get_u64_le(), data.get_u64_le())
        } else {
            (data.get_u32_le() as u64, data.get_u32_le() as u64)
        };
        let flags = SegmentFlags(data.get_u8());

        Ok(Self {
            content_start,
            content_length,
            flags,
        })
    }
}

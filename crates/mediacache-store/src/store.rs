//! Segment store: owns the backing container, the persistent header, and
//! the ordered collection of segments.
//!
//! The store decides where each written range lands (append, fill, or a
//! fresh segment), locates covering segments for reads, answers coverage
//! and gap queries, and - while streaming - reclaims consumed bytes so a
//! bounded container keeps absorbing new data without growing.

use std::path::Path;

use mediacache_common::{ByteRange, CacheError, ConsumePolicy, Result, StoreConfig};
use tracing::debug;

use crate::backing::BackingStore;
use crate::format::{
    HeaderFlags, SegmentFlags, MAGIC, MEMORY_SLACK, NARROW_DEFAULT_MAX_SIZE,
    SIMULATED_UNBOUNDED_CAP, VERSION,
};
use crate::segment::{DirectoryRecord, Segment};

/// Answer to a single-position coverage probe: either `length` contiguous
/// bytes are available starting at the position, or `length` bytes are
/// missing before anything is available (`length == 0` when nothing
/// follows at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialCoverage {
    /// True if content is available at the probed position.
    pub available: bool,
    /// Available run length, or the size of the gap to the next segment.
    pub length: u64,
}

/// Segmented cache store over one backing container.
pub struct SegmentStore {
    backing: BackingStore,
    header_flags: HeaderFlags,
    /// Maximum total content bytes (0 = unbounded). Fixed at creation.
    max_size: u64,
    /// Number of directory slots. Fixed at creation.
    max_segments: u16,
    /// Running sum of content and empty space across all segments.
    cached_size: u64,
    segments: Vec<Segment>,
    streaming: bool,
    consume_policy: ConsumePolicy,
    auto_delete_on_streaming: bool,
    empty_space_recovery: bool,
}

impl SegmentStore {
    /// Opens or creates a file-backed store.
    ///
    /// An existing container with a valid header is reloaded, including
    /// crash recovery for a segment left open mid-append. A missing,
    /// short, or corrupt header reinitializes the container in place.
    pub fn open_file(path: &Path, config: &StoreConfig) -> Result<Self> {
        let backing = BackingStore::open_file(path)?;
        Self::construct(backing, config)
    }

    /// Creates a memory-backed store.
    ///
    /// Requires a bounded configuration; the buffer is pre-sized to the
    /// content capacity plus header, directory, and slack.
    pub fn open_memory(config: &StoreConfig) -> Result<Self> {
        if config.max_size == 0 {
            return Err(CacheError::OutOfRange(
                "memory-backed store requires a bounded max_size".to_string(),
            ));
        }

        let flags = Self::flags_for(config);
        let full_header = flags.header_size() + config.max_segments as u64 * flags.record_size();
        let capacity = config.max_size + full_header + MEMORY_SLACK as u64;

        let backing = BackingStore::open_memory(capacity as usize)?;
        Self::construct(backing, config)
    }

    fn flags_for(config: &StoreConfig) -> HeaderFlags {
        let mut flags = HeaderFlags::empty();
        flags.set_wide(config.wide_offsets);
        flags.set_guards(config.guard_bytes);
        flags
    }

    fn construct(backing: BackingStore, config: &StoreConfig) -> Result<Self> {
        if config.max_segments == 0 {
            return Err(CacheError::OutOfRange(
                "max_segments must be at least 1".to_string(),
            ));
        }

        let mut store = Self {
            backing,
            header_flags: Self::flags_for(config),
            max_size: config.max_size,
            max_segments: config.max_segments,
            cached_size: 0,
            segments: Vec::new(),
            streaming: false,
            consume_policy: ConsumePolicy::None,
            auto_delete_on_streaming: config.auto_delete_on_streaming,
            empty_space_recovery: config.empty_space_recovery,
        };

        let mut valid = false;
        let len = store.backing.len()?;

        if len >= crate::format::HEADER_FIXED_SIZE {
            store.backing.set_read_position(0);
            let mut magic = [0u8; 4];
            store.backing.read_buf(&mut magic)?;
            let version = store.backing.read_u8()?;

            if magic == MAGIC && version == VERSION {
                let flags = HeaderFlags(store.backing.read_u8()?);
                if len >= flags.header_size() {
                    store.header_flags = flags;
                    valid = true;
                }
            }
        }

        if valid {
            store.max_size = if store.header_flags.is_wide() {
                store.backing.read_u64()?
            } else {
                store.backing.read_u32()? as u64
            };
            store.max_segments = store.backing.read_u16()?;
            if store.max_segments == 0 {
                return Err(CacheError::Corrupt(
                    "container header declares zero segment slots".to_string(),
                ));
            }
            store.load_all_segments()?;
            debug!(
                max_size = store.max_size,
                max_segments = store.max_segments,
                segments = store.segments.len(),
                cached = store.cached_size,
                "loaded existing container"
            );
        } else {
            // Too short or wrong signature/version: recover by starting fresh.
            store.backing.truncate()?;

            if !store.header_flags.is_wide() && store.max_size == 0 {
                // Keep lengths representable in 32 bits.
                store.max_size = NARROW_DEFAULT_MAX_SIZE;
            }

            store.write_initial_header()?;
            if store.header_flags.is_wide() {
                store.backing.write_u64(store.max_size)?;
            } else {
                store.backing.write_u32(store.max_size as u32)?;
            }
            store.backing.write_u16(store.max_segments)?;
            store.write_all_segments(false)?;
            debug!(
                max_size = store.max_size,
                max_segments = store.max_segments,
                "initialized fresh container"
            );
        }

        store.debug_invariants();

        Ok(store)
    }

    /// Physical offset of the directory slot at `index`.
    fn segment_pos(&self, index: u16) -> u64 {
        self.header_flags.header_size() + index as u64 * self.header_flags.record_size()
    }

    /// Size of the header plus the full segment directory.
    pub fn full_header_len(&self) -> u64 {
        self.segment_pos(self.max_segments)
    }

    /// Writes the fixed header prefix (signature, version, flags).
    fn write_initial_header(&mut self) -> Result<()> {
        self.backing.set_write_position(0);
        self.backing.write_buf(&MAGIC)?;
        self.backing.write_u8(VERSION)?;
        self.backing.write_u8(self.header_flags.0)?;
        Ok(())
    }

    /// Reconstructs the in-memory segment list from the directory.
    ///
    /// File offsets are rebuilt cumulatively from the persisted lengths. A
    /// zero-length slot flagged new marks a crash mid-append: its true
    /// length is whatever the container holds past its offset.
    fn load_all_segments(&mut self) -> Result<()> {
        let guard = self.header_flags.guard_len();
        let full_header = self.full_header_len();
        let mut virtual_position = full_header;

        self.segments.clear();
        self.cached_size = 0;

        for _ in 0..self.max_segments {
            let record = self.read_record()?;
            let file_start = virtual_position + guard;
            let mut content_length = record.content_length;

            if content_length == 0 {
                if record.flags.is_new() {
                    // Crash during an append: content lasts to end of file.
                    let file_len = self.backing.len()?;
                    content_length = file_len.saturating_sub(file_start);
                    if content_length == 0 {
                        break;
                    }
                } else {
                    // Unused slot: the segment list ends here.
                    break;
                }
            }

            self.cached_size += content_length;

            let mut segment =
                Segment::new(file_start, record.content_start, content_length, record.flags);
            if record.flags.is_dirty() {
                // Remnant of an interrupted streaming session.
                segment.discarded = true;
            }
            self.segments.push(segment);

            virtual_position += guard + content_length;
        }

        Ok(())
    }

    fn read_record(&mut self) -> Result<DirectoryRecord> {
        let mut buf = [0u8; 17];
        let size = self.header_flags.record_size() as usize;
        self.backing.read_buf(&mut buf[..size])?;
        DirectoryRecord::from_bytes(&buf[..size], self.header_flags)
    }

    /// Rewrites one directory slot with the segment's current state.
    fn update_segment_disk(&mut self, index: usize) -> Result<()> {
        let seg = &self.segments[index];
        let record = DirectoryRecord {
            content_start: seg.content_start,
            content_length: seg.content_length,
            flags: seg.flags,
        };
        let bytes = record.to_bytes(self.header_flags);
        self.backing.set_write_position(self.segment_pos(index as u16));
        self.backing.write_buf(&bytes)
    }

    /// Rewrites the whole directory as a consistent snapshot, optionally
    /// refreshing the header's size fields first. Live segments persist
    /// their full physical span (content plus empty space); trailing
    /// unused slots are zeroed.
    fn write_all_segments(&mut self, update_header: bool) -> Result<()> {
        if update_header {
            self.backing
                .set_write_position(crate::format::HEADER_FIXED_SIZE);
            if self.header_flags.is_wide() {
                self.backing.write_u64(self.max_size)?;
            } else {
                self.backing.write_u32(self.max_size as u32)?;
            }
            self.backing.write_u16(self.max_segments)?;
        } else {
            self.backing.set_write_position(self.segment_pos(0));
        }

        for index in 0..self.segments.len() {
            let seg = &self.segments[index];
            let record = DirectoryRecord {
                content_start: seg.content_start,
                content_length: seg.full_span(),
                flags: seg.flags,
            };
            let bytes = record.to_bytes(self.header_flags);
            self.backing.write_buf(&bytes)?;
        }

        let empty = DirectoryRecord::EMPTY.to_bytes(self.header_flags);
        for _ in self.segments.len()..self.max_segments as usize {
            self.backing.write_buf(&empty)?;
        }

        self.debug_invariants();

        Ok(())
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The live segments, in slot order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Total content and empty-space bytes currently accounted for.
    pub fn cached_size(&self) -> u64 {
        self.cached_size
    }

    /// Maximum total content bytes (0 = unbounded).
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Number of directory slots.
    pub fn max_segments(&self) -> u16 {
        self.max_segments
    }

    /// Returns true if streaming mode is active.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// The active consume policy.
    pub fn consume_policy(&self) -> ConsumePolicy {
        self.consume_policy
    }

    /// Switches the store into bounded streaming mode with the given
    /// consume policy. Requires a bounded store with room for the
    /// master/reserve segment pair.
    pub fn activate_streaming(&mut self, policy: ConsumePolicy) -> Result<()> {
        if self.max_size == 0 {
            return Err(CacheError::Unsupported(
                "streaming requires a bounded store".to_string(),
            ));
        }
        if self.max_segments < 2 {
            return Err(CacheError::OutOfRange(
                "streaming requires at least two directory slots".to_string(),
            ));
        }

        self.streaming = true;
        self.consume_policy = policy;

        debug!(?policy, "streaming activated");

        Ok(())
    }

    /// Leaves streaming mode; the consume policy resets to none.
    pub fn disable_streaming(&mut self) {
        self.streaming = false;
        self.consume_policy = ConsumePolicy::None;
    }

    /// Remaining writable bytes, counting reclaimable empty space while
    /// streaming. Unbounded stores report against a simulated cap.
    pub fn available_space(&self) -> u64 {
        let mut avail = if self.max_size > 0 {
            self.max_size - self.cached_size
        } else {
            SIMULATED_UNBOUNDED_CAP.saturating_sub(self.cached_size)
        };

        if self.streaming {
            for seg in &self.segments {
                avail += seg.empty_space;
            }
        }

        avail
    }

    /// Lowest start and highest end across all segments, as a range.
    ///
    /// This is the optimistic view of the resource: the true total length
    /// may be unknown until the download completes.
    pub fn optimistic_full_range(&self) -> ByteRange {
        let mut start = 0u64;
        let mut end = 0u64;

        for (i, seg) in self.segments.iter().enumerate() {
            if i == 0 || seg.content_start < start {
                start = seg.content_start;
            }
            if i == 0 || seg.content_end() > end {
                end = seg.content_end();
            }
        }

        ByteRange::new(start, end - start)
    }

    /// Container length minus header and directory.
    pub fn content_region_len(&mut self) -> Result<u64> {
        let len = self.backing.len()?;
        Ok(len.saturating_sub(self.full_header_len()))
    }

    /// Writes `buf` at the given logical position, returning the number of
    /// bytes accepted. Partial writes are a normal outcome of a bounded
    /// store, not an error.
    ///
    /// While streaming with consume-on-write, already-read bytes are
    /// reclaimed first so the bounded container never needs to grow; a
    /// write that must straddle master and reserve is split into two
    /// placements.
    pub fn write_content(&mut self, position: u64, buf: &[u8]) -> Result<usize> {
        let original_len = buf.len();
        let mut len = original_len;

        if self.streaming && self.consume_policy == ConsumePolicy::OnWrite {
            let total_empty = self.available_space();
            if total_empty < original_len as u64 {
                let consumed = self.auto_consume(original_len as u64 - total_empty)?;
                len = (total_empty + consumed).min(original_len as u64) as usize;
            }
        }

        if len == 0 {
            return Ok(0);
        }

        let mut written = self.write_content_kernel(position, &buf[..len])?;

        // A streaming write may need to land partly in the master and
        // partly in the reserve; the kernel only ever fills one segment,
        // so a shortfall gets exactly one more placement attempt.
        if self.streaming && written < len {
            if let Ok(more) =
                self.write_content_kernel(position + written as u64, &buf[written..len])
            {
                written += more;
            }
        }

        Ok(written)
    }

    /// Places and writes `buf` into a single segment.
    fn write_content_kernel(&mut self, position: u64, buf: &[u8]) -> Result<usize> {
        if !self.backing.is_open() {
            return Err(CacheError::Unsupported("container is closed".to_string()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let (index, file_pos) = self.write_segment_for_position(position, true)?;

        let usable_empty_space = if self.streaming {
            self.segments[index].empty_space
        } else {
            0
        };
        let last_segment = index == self.segments.len() - 1;

        let written = self.write_content_direct(file_pos, buf, usable_empty_space, last_segment)?;

        let extension = self.segments[index].add_content(written as u64);

        if let Some(reserve_index) = self.segments[index].reserve {
            // The reserve should hold no content while its master is still
            // being appended; anything it does hold is dropped back into
            // empty space so the pair stays coherent.
            let anchor = self.segments[index].content_start + self.segments[index].full_span();
            let reserve = &mut self.segments[reserve_index];
            reserve.empty_space += reserve.content_length;
            reserve.content_length = 0;
            reserve.content_start = anchor;
        }

        // Empty space that got filled was already accounted for.
        self.cached_size += extension;

        self.debug_invariants();

        Ok(written)
    }

    /// Transfers bytes to the container, clamped so `cached_size` never
    /// exceeds `max_size`: empty space is freely usable, and the overall
    /// cap may additionally grow only through the last segment.
    fn write_content_direct(
        &mut self,
        file_pos: u64,
        buf: &[u8],
        usable_empty_space: u64,
        last_segment: bool,
    ) -> Result<usize> {
        let mut size = buf.len() as u64;

        if self.max_size > 0 {
            if self.cached_size >= self.max_size && usable_empty_space == 0 {
                return Err(CacheError::OutOfRange("cache full".to_string()));
            }

            if usable_empty_space > 0 {
                let available = if last_segment {
                    (self.max_size - self.cached_size) + usable_empty_space
                } else {
                    usable_empty_space
                };
                size = size.min(available);
            } else if self.cached_size + size > self.max_size {
                size = self.max_size - self.cached_size;
            }
        }

        self.backing.set_write_position(file_pos);
        self.backing.write_buf(&buf[..size as usize])?;

        Ok(size as usize)
    }

    /// Picks the segment a write at `position` lands in, in priority
    /// order: append to the last segment, fill a streaming segment's
    /// empty space, reject overwrites, reset a streaming store that
    /// cannot represent the position, or allocate a fresh segment at the
    /// end of the container.
    fn write_segment_for_position(
        &mut self,
        position: u64,
        update_disk: bool,
    ) -> Result<(usize, u64)> {
        // The last segment has priority, also to let the container grow,
        // but not once the store is at its cap.
        if !self.segments.is_empty() && (self.max_size == 0 || self.cached_size < self.max_size) {
            let last = self.segments.len() - 1;

            if let Some(file_pos) = self.segments[last].can_append_content(position) {
                if !self.segments[last].is_new() {
                    // Persisting the new flag first is the crash-recovery
                    // anchor: the append that follows can be re-measured
                    // from the container length at reload.
                    self.segments[last].flags.set_new(true);
                    if update_disk {
                        self.update_segment_disk(last)?;
                    }
                }
                return Ok((last, file_pos));
            } else if self.segments[last].is_new() {
                // A different write target interrupts the open segment:
                // close it before trying other placements.
                self.segments[last].flags.set_new(false);
                if update_disk {
                    self.update_segment_disk(last)?;
                }
            }
        }

        let mut could_append_but_full = false;

        // While streaming, a write can land in the trailing empty region
        // of a segment without any directory restructuring. Most recently
        // active segments are tried first.
        if self.streaming {
            for index in (0..self.segments.len()).rev() {
                if let Some(file_pos) = self.segments[index].can_append_content(position) {
                    if self.segments[index].empty_space > 0 {
                        return Ok((index, file_pos));
                    }
                    // Segment full; keep searching.
                    could_append_but_full = true;
                }
            }
        }

        // Overwriting bytes already stored is unsupported.
        for index in (0..self.segments.len()).rev() {
            if self.segments[index]
                .contains_content_beginning(position)
                .is_some()
            {
                return Err(CacheError::Unsupported(
                    "overwrite of already-stored content".to_string(),
                ));
            }
        }

        // A streaming writer that seeks somewhere no segment can absorb is
        // not representable incrementally: drop everything and start over.
        if self.streaming
            && self.auto_delete_on_streaming
            && !could_append_but_full
            && !self.segments.is_empty()
        {
            debug!(position, "streaming write seek; dropping all content");
            self.delete_content()?;
        }

        if self.segments.len() >= self.max_segments as usize {
            return Err(CacheError::OutOfRange(
                "no free segment directory slot".to_string(),
            ));
        }
        if self.max_size > 0 && self.cached_size >= self.max_size {
            return Err(CacheError::OutOfRange("cache full".to_string()));
        }

        // New segment at the end of the container.
        let file_len = self.backing.len()?;
        let file_offset = file_len + self.header_flags.guard_len();

        let mut flags = SegmentFlags::empty();
        flags.set_new(true);
        self.segments.push(Segment::new(file_offset, position, 0, flags));

        let index = self.segments.len() - 1;

        // The first streaming segment claims the whole ring up front,
        // which keeps every later placement a fill rather than a grow.
        if index == 0 && self.streaming && self.max_size > 0 {
            let seg = &mut self.segments[index];
            seg.empty_space = self.max_size;
            seg.flags.set_dirty(true);
            self.cached_size = self.max_size;
        }

        if update_disk {
            self.update_segment_disk(index)?;
        }

        Ok((index, self.segments[index].file_offset))
    }

    /// Reads up to `buf.len()` bytes at the given logical position from a
    /// single covering segment. Returns how many bytes were read; a
    /// position nothing covers reports [`CacheError::NotCached`].
    pub fn read_content(&mut self, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.debug_invariants();

        if !self.backing.is_open() {
            return Err(CacheError::Unsupported("container is closed".to_string()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut found: Option<usize> = None;
        let mut bytes_available = 0u64;
        let mut file_pos = 0u64;

        for index in (0..self.segments.len()).rev() {
            if let Some((available, pos)) = self.segments[index].contains_content_beginning(position)
            {
                found = Some(index);
                bytes_available = available;
                file_pos = pos;
                break;
            }
        }

        if found.is_none() {
            if self.streaming && self.empty_space_recovery {
                // The bytes may be logically consumed but still physically
                // present in a reserve's trailing space.
                let (available, pos) = self.retrieve_from_empty_space(position)?;
                bytes_available = available;
                file_pos = pos;
            } else {
                return Err(CacheError::NotCached { position });
            }
        }

        let bytes_to_read = bytes_available.min(buf.len() as u64) as usize;

        self.backing.set_read_position(file_pos);
        self.backing.read_buf(&mut buf[..bytes_to_read])?;

        // Bytes served from recovered empty space are never consumed;
        // that would need a second pass over the master.
        if self.streaming && self.consume_policy == ConsumePolicy::OnRead {
            if let Some(index) = found {
                let skip = position - self.segments[index].content_start;

                if self.segments[index].reserve.is_none() && self.segments.len() == 2 {
                    // The read came from the reserve, which logically
                    // follows the master despite preceding it physically:
                    // consume the master fully (promoting the reserve into
                    // it), then consume up to the read point.
                    let master = 1 - index;
                    let master_start = self.segments[master].content_start;
                    let master_len = self.segments[master].content_length;
                    self.consume_bytes(master, master_start, master_len)?;

                    let promoted_start = self.segments[master].content_start;
                    self.consume_bytes(master, promoted_start, position - promoted_start)?;
                } else {
                    let start = self.segments[index].content_start;
                    self.consume_bytes(index, start, skip + bytes_to_read as u64)?;
                }
            }
        }

        self.debug_invariants();

        Ok(bytes_to_read)
    }

    /// Locates consumed-but-present bytes in a reserve's trailing space.
    ///
    /// The reserve precedes its master physically while following it
    /// logically, so bytes consumed from the master's front stay readable
    /// immediately before the master's current physical start.
    fn retrieve_from_empty_space(&self, position: u64) -> Result<(u64, u64)> {
        if !self.empty_space_recovery {
            return Err(CacheError::Unsupported(
                "empty-space recovery is disabled".to_string(),
            ));
        }

        for index in (0..self.segments.len()).rev() {
            if self.empty_space_contains(index, position) {
                let seg = &self.segments[index];
                // The master's start is the end of the recoverable run.
                let bytes_available = seg.content_start - position;
                let file_pos = seg.file_offset - bytes_available;
                return Ok((bytes_available, file_pos));
            }
        }

        Err(CacheError::NotCached { position })
    }

    /// Returns true if `position` falls in the consumed span immediately
    /// before the given segment's content, still held by its reserve.
    fn empty_space_contains(&self, index: usize, position: u64) -> bool {
        let seg = &self.segments[index];
        match seg.reserve {
            Some(reserve_index) => {
                let empty = self.segments[reserve_index].empty_space;
                empty > 0
                    && seg.content_start > position
                    && seg.content_start.saturating_sub(empty) <= position
            }
            None => false,
        }
    }

    /// Consumes bytes from a segment's front: everything before `position`
    /// plus the next `bytes_to_consume` bytes moves into the reserve's
    /// empty space. The reserve is created lazily on first use; a fully
    /// consumed master absorbs its reserve's identity.
    pub(crate) fn consume_bytes(
        &mut self,
        seg_index: usize,
        position: u64,
        bytes_to_consume: u64,
    ) -> Result<()> {
        let mut seg_index = seg_index;

        if seg_index >= self.segments.len() {
            return Err(CacheError::Internal(format!(
                "consume on unknown segment {}",
                seg_index
            )));
        }

        // The flags must be durable before any consumed byte is trusted.
        if !self.segments[seg_index].is_dirty() {
            self.segments[seg_index].flags.set_dirty(true);
            self.segments[seg_index].flags.set_new(false);
            self.update_segment_disk(seg_index)?;
        }

        if self.segments[seg_index].reserve.is_none() {
            if self.segments.len() >= self.max_segments as usize {
                return Err(CacheError::OutOfRange(
                    "no free segment directory slot for a reserve".to_string(),
                ));
            }

            // A zero-length placeholder anchored at the segment's current
            // physical front, logically at its complete end.
            let seg = &self.segments[seg_index];
            let mut flags = SegmentFlags::empty();
            flags.set_dirty(true);
            let reserve = Segment::new(
                seg.file_offset,
                seg.content_start + seg.full_span(),
                0,
                flags,
            );

            self.segments.push(reserve);
            let last = self.segments.len() - 1;

            // Keep the reserve's slot index before the master's.
            self.segments.swap(seg_index, last);
            let reserve_index = seg_index;
            seg_index = last;

            self.segments[seg_index].reserve = Some(reserve_index);

            self.update_segment_disk(reserve_index)?;
            self.update_segment_disk(seg_index)?;

            self.debug_invariants();
        }

        let reserve_index = self.segments[seg_index]
            .reserve
            .ok_or_else(|| CacheError::Internal("consume without a reserve".to_string()))?;

        let dumped = self.segments[seg_index].consume_front(position, bytes_to_consume)?;
        self.segments[reserve_index].empty_space += dumped;

        // A fully consumed master takes over its reserve's stored range;
        // the reserve resets to a fresh placeholder at the new end.
        if self.segments[seg_index].content_length == 0 {
            let (reserve_length, reserve_offset, reserve_empty) = {
                let reserve = &self.segments[reserve_index];
                (
                    reserve.content_length,
                    reserve.file_offset,
                    reserve.empty_space,
                )
            };

            let master = &mut self.segments[seg_index];
            master.content_length = reserve_length;
            master.file_offset = reserve_offset;
            master.empty_space += reserve_empty;
            let anchor = master.content_start + master.full_span();

            let reserve = &mut self.segments[reserve_index];
            reserve.content_start = anchor;
            reserve.content_length = 0;
            reserve.empty_space = 0;
        }

        self.debug_invariants();

        Ok(())
    }

    /// The segment with the lowest content start that still has content.
    fn find_segment_for_auto_consume(&self) -> Option<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, seg)| seg.content_length > 0)
            .min_by_key(|(_, seg)| seg.content_start)
            .map(|(index, _)| index)
    }

    /// Reclaims up to `bytes_to_consume` bytes, oldest content first.
    /// Returns how many bytes were actually reclaimed.
    pub(crate) fn auto_consume(&mut self, bytes_to_consume: u64) -> Result<u64> {
        if !self.streaming {
            return Err(CacheError::Unsupported(
                "consume requires streaming mode".to_string(),
            ));
        }

        let mut consumed = 0u64;

        while consumed < bytes_to_consume {
            let Some(index) = self.find_segment_for_auto_consume() else {
                break;
            };

            let seg_len = self.segments[index].content_length;
            let now = seg_len.min(bytes_to_consume - consumed);
            let start = self.segments[index].content_start;

            self.consume_bytes(index, start, now)?;
            consumed += now;
        }

        Ok(consumed)
    }

    /// The covered ranges overlapping the requested window, in slot order.
    /// A `None` length means "through the end of the resource".
    pub fn get_unsorted_coverage(&self, start: u64, len: Option<u64>) -> Result<Vec<ByteRange>> {
        let mut out = Vec::new();
        out.try_reserve(self.segments.len())
            .map_err(|_| CacheError::OutOfMemory {
                requested: self.segments.len(),
            })?;

        for seg in &self.segments {
            if seg.discarded {
                continue;
            }
            if let Some((available_start, available_len, _)) =
                seg.contains_partial_content(start, len)
            {
                out.push(ByteRange::new(available_start, available_len));
            }
        }

        Ok(out)
    }

    /// The covered ranges overlapping the requested window, sorted by
    /// start; adjacent ranges are merged when `merge` is set.
    pub fn get_sorted_coverage(
        &self,
        start: u64,
        len: Option<u64>,
        merge: bool,
    ) -> Result<Vec<ByteRange>> {
        let mut ranges = self.get_unsorted_coverage(start, len)?;
        ranges.sort_by_key(|range| range.start);

        if merge {
            let mut merged: Vec<ByteRange> = Vec::new();
            merged
                .try_reserve(ranges.len())
                .map_err(|_| CacheError::OutOfMemory {
                    requested: ranges.len(),
                })?;

            for range in ranges {
                match merged.last_mut() {
                    Some(prev) if prev.adjoins(&range) => prev.length += range.length,
                    _ => merged.push(range),
                }
            }
            return Ok(merged);
        }

        Ok(ranges)
    }

    /// The gaps within the requested window: the complement of the sorted
    /// coverage. This is what drives "what should be downloaded next".
    pub fn get_missing_coverage(&self, start: u64, len: Option<u64>) -> Result<Vec<ByteRange>> {
        let covered = self.get_sorted_coverage(start, len, false)?;

        let mut missing = Vec::new();
        missing
            .try_reserve(covered.len() + 1)
            .map_err(|_| CacheError::OutOfMemory {
                requested: covered.len() + 1,
            })?;

        let mut cur = start;
        let end = len.map(|l| start + l);

        for range in &covered {
            if let Some(end) = end {
                if cur >= end {
                    break;
                }
            }

            if range.start <= cur {
                // Only the first range can start before the window.
                if range.end() > cur {
                    cur = range.end();
                }
            } else {
                missing.push(ByteRange::new(cur, range.start - cur));
                cur = range.end();
            }
        }

        if let Some(end) = end {
            if cur < end {
                missing.push(ByteRange::new(cur, end - cur));
            }
        }

        Ok(missing)
    }

    /// Probes a single position: how many contiguous bytes are available
    /// starting there (optionally following across adjoining segments), or
    /// how many bytes are missing before anything is available.
    pub fn get_partial_coverage(&self, position: u64, multiple_segments: bool) -> PartialCoverage {
        let mut length = 0u64;
        let mut position = position;
        let mut segments_hit = 0;
        let mut closest: Option<usize> = None;

        loop {
            let mut advanced = false;

            for (index, seg) in self.segments.iter().enumerate() {
                if seg.discarded {
                    continue;
                }

                if seg.content_start <= position && seg.content_end() > position {
                    length += seg.content_end() - position;
                    if !multiple_segments {
                        return PartialCoverage {
                            available: true,
                            length,
                        };
                    }
                    position = seg.content_end();
                    segments_hit += 1;
                    advanced = true;
                    break;
                } else if self.empty_space_recovery && self.empty_space_contains(index, position) {
                    length += seg.content_start - position;
                    if !multiple_segments {
                        return PartialCoverage {
                            available: true,
                            length,
                        };
                    }
                    position = seg.content_start;
                    segments_hit += 1;
                    advanced = true;
                    break;
                }

                // Track the closest segment past the position for the gap
                // computation below.
                if seg.content_start > position && seg.content_length > 0 {
                    let closer = match closest {
                        None => true,
                        Some(c) => seg.content_start < self.segments[c].content_start,
                    };
                    if closer {
                        closest = Some(index);
                    }
                }
            }

            if !advanced {
                break;
            }
        }

        if segments_hit > 0 {
            return PartialCoverage {
                available: true,
                length,
            };
        }

        let mut gap = 0u64;
        if let Some(index) = closest {
            gap = self.segments[index].content_start - position;

            // Bytes recoverable from the following master's reserve shrink
            // the gap.
            if self.empty_space_recovery {
                if let Some(reserve_index) = self.segments[index].reserve {
                    let empty = self.segments[reserve_index].empty_space;
                    if empty < gap {
                        gap -= empty;
                    }
                }
            }
        }

        PartialCoverage {
            available: false,
            length: gap,
        }
    }

    /// Flushes pending bytes to the backing container.
    pub fn flush_buffer(&mut self) -> Result<()> {
        if !self.backing.is_open() {
            return Ok(());
        }
        self.backing.flush()
    }

    /// Rewrites the header and the full directory, then closes the
    /// backing container. Idempotent.
    pub fn close_all(&mut self) -> Result<()> {
        if !self.backing.is_open() {
            return Ok(());
        }

        self.write_initial_header()?;
        self.write_all_segments(true)?;
        self.backing.close()?;

        self.segments.clear();
        self.cached_size = 0;

        Ok(())
    }

    /// Truncates the container, drops all segments, and reinitializes the
    /// header and an empty directory.
    pub fn delete_content(&mut self) -> Result<()> {
        debug!("deleting all cached content");

        self.backing.truncate()?;

        self.segments.clear();
        self.cached_size = 0;

        self.write_initial_header()?;
        self.write_all_segments(true)?;

        Ok(())
    }

    /// Verifies the store's structural invariants.
    ///
    /// Intended for test seams after structural mutations; debug builds
    /// run it after every one.
    pub fn check_invariants(&self) -> Result<()> {
        if self.segments.len() > self.max_segments as usize {
            return Err(CacheError::Internal(format!(
                "{} segments exceed the {} directory slots",
                self.segments.len(),
                self.max_segments
            )));
        }

        let mut content = 0u64;
        let mut empty = 0u64;
        let mut new_segments = 0;
        let mut any_reserve = false;

        for (index, seg) in self.segments.iter().enumerate() {
            content += seg.content_length;
            empty += seg.empty_space;

            if seg.is_new() {
                new_segments += 1;
            }
            if seg.empty_space > 0 && !seg.is_dirty() {
                return Err(CacheError::Internal(format!(
                    "segment {} has empty space but is not dirty",
                    index
                )));
            }

            if let Some(reserve_index) = seg.reserve {
                any_reserve = true;
                let reserve = self.segments.get(reserve_index).ok_or_else(|| {
                    CacheError::Internal(format!(
                        "segment {} references missing reserve {}",
                        index, reserve_index
                    ))
                })?;

                if reserve.file_offset + reserve.full_span() != seg.file_offset {
                    return Err(CacheError::Internal(format!(
                        "reserve {} does not abut master {}",
                        reserve_index, index
                    )));
                }
                if reserve.content_start != seg.content_start + seg.full_span() {
                    return Err(CacheError::Internal(format!(
                        "reserve {} is not anchored at master {}'s end",
                        reserve_index, index
                    )));
                }
            }
        }

        if !self.streaming && content != self.cached_size {
            return Err(CacheError::Internal(format!(
                "content bytes {} do not match cached size {}",
                content, self.cached_size
            )));
        }
        if content + empty != self.cached_size {
            return Err(CacheError::Internal(format!(
                "content {} + empty {} does not match cached size {}",
                content, empty, self.cached_size
            )));
        }
        if new_segments > 1 {
            return Err(CacheError::Internal(format!(
                "{} segments are flagged new",
                new_segments
            )));
        }
        if self.max_size > 0 && self.cached_size > self.max_size {
            return Err(CacheError::Internal(format!(
                "cached size {} exceeds max size {}",
                self.cached_size, self.max_size
            )));
        }
        if self.streaming && self.max_size == 0 {
            return Err(CacheError::Internal(
                "streaming on an unbounded store".to_string(),
            ));
        }
        if !self.streaming && self.consume_policy != ConsumePolicy::None {
            return Err(CacheError::Internal(
                "consume policy set while not streaming".to_string(),
            ));
        }
        if self.streaming && any_reserve && self.segments.len() > 2 {
            return Err(CacheError::Internal(format!(
                "{} live segments under the streaming pair discipline",
                self.segments.len()
            )));
        }

        Ok(())
    }

    #[cfg(debug_assertions)]
    fn debug_invariants(&self) {
        if let Err(err) = self.check_invariants() {
            panic!("invariant violation: {err}");
        }
    }

    #[cfg(not(debug_assertions))]
    fn debug_invariants(&self) {}
}

impl Drop for SegmentStore {
    fn drop(&mut self) {
        // Flush pending state; never truncate or discard segments here.
        let _ = self.flush_buffer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn memory_store(max_size: u64, max_segments: u16) -> SegmentStore {
        SegmentStore::open_memory(&StoreConfig::bounded(max_size, max_segments)).unwrap()
    }

    #[test]
    fn test_fresh_memory_store() {
        let store = memory_store(1024, 4);
        assert_eq!(store.max_size(), 1024);
        assert_eq!(store.max_segments(), 4);
        assert_eq!(store.segment_count(), 0);
        assert_eq!(store.cached_size(), 0);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_memory_store_requires_bound() {
        let config = StoreConfig {
            max_size: 0,
            ..Default::default()
        };
        assert!(SegmentStore::open_memory(&config).is_err());
    }

    #[test]
    fn test_zero_slots_rejected() {
        let config = StoreConfig {
            max_size: 1024,
            max_segments: 0,
            ..Default::default()
        };
        assert!(SegmentStore::open_memory(&config).is_err());
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut store = memory_store(1024, 4);

        let accepted = store.write_content(0, b"hello world").unwrap();
        assert_eq!(accepted, 11);
        assert_eq!(store.cached_size(), 11);

        let mut buf = [0u8; 11];
        let read = store.read_content(0, &mut buf).unwrap();
        assert_eq!(read, 11);
        assert_eq!(&buf, b"hello world");
    }

    #[test]
    fn test_append_grows_single_segment() {
        let mut store = memory_store(1024, 4);

        store.write_content(0, b"aaaa").unwrap();
        store.write_content(4, b"bbbb").unwrap();
        assert_eq!(store.segment_count(), 1);
        assert_eq!(store.segments()[0].content_length(), 8);

        let mut buf = [0u8; 8];
        store.read_content(0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaabbbb");
    }

    #[test]
    fn test_disjoint_writes_create_segments() {
        let mut store = memory_store(1024, 4);

        store.write_content(0, b"front").unwrap();
        store.write_content(100, b"back").unwrap();
        assert_eq!(store.segment_count(), 2);

        let mut buf = [0u8; 4];
        store.read_content(100, &mut buf).unwrap();
        assert_eq!(&buf, b"back");
    }

    #[test]
    fn test_overwrite_rejected() {
        let mut store = memory_store(1024, 4);

        store.write_content(0, b"original").unwrap();
        let result = store.write_content(2, b"xx");
        assert!(matches!(result, Err(CacheError::Unsupported(_))));

        // Existing content is untouched.
        let mut buf = [0u8; 8];
        store.read_content(0, &mut buf).unwrap();
        assert_eq!(&buf, b"original");
    }

    #[test]
    fn test_read_uncached_position() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, b"data").unwrap();

        let mut buf = [0u8; 4];
        let result = store.read_content(500, &mut buf);
        assert!(matches!(
            result,
            Err(CacheError::NotCached { position: 500 })
        ));
    }

    #[test]
    fn test_read_clamped_to_one_segment() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, b"abc").unwrap();
        store.write_content(10, b"def").unwrap();

        // A read never implicitly crosses into another segment.
        let mut buf = [0u8; 16];
        let read = store.read_content(0, &mut buf).unwrap();
        assert_eq!(read, 3);
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_segment_slots_exhausted() {
        let mut store = memory_store(1024, 2);

        store.write_content(0, b"a").unwrap();
        store.write_content(10, b"b").unwrap();
        let result = store.write_content(20, b"c");
        assert!(matches!(result, Err(CacheError::OutOfRange(_))));
    }

    #[test]
    fn test_bounded_write_is_clamped() {
        let mut store = memory_store(8, 2);

        let accepted = store.write_content(0, b"0123456789").unwrap();
        assert_eq!(accepted, 8);
        assert_eq!(store.cached_size(), 8);

        let result = store.write_content(8, b"x");
        assert!(matches!(result, Err(CacheError::OutOfRange(_))));
    }

    #[test]
    fn test_optimistic_full_range() {
        let mut store = memory_store(1024, 4);
        assert_eq!(store.optimistic_full_range(), ByteRange::new(0, 0));

        store.write_content(50, b"xxxx").unwrap();
        store.write_content(200, b"yy").unwrap();

        let range = store.optimistic_full_range();
        assert_eq!(range.start, 50);
        assert_eq!(range.end(), 202);
    }

    #[test]
    fn test_available_space() {
        let mut store = memory_store(100, 4);
        assert_eq!(store.available_space(), 100);

        store.write_content(0, &[0u8; 30]).unwrap();
        assert_eq!(store.available_space(), 70);
    }

    #[test]
    fn test_streaming_requires_bound_and_slots() {
        let dir = tempdir().unwrap();
        let mut unbounded = SegmentStore::open_file(
            &dir.path().join("u.mc"),
            &StoreConfig::default(),
        )
        .unwrap();
        assert!(matches!(
            unbounded.activate_streaming(ConsumePolicy::OnRead),
            Err(CacheError::Unsupported(_))
        ));

        let mut narrow = memory_store(64, 1);
        assert!(matches!(
            narrow.activate_streaming(ConsumePolicy::OnRead),
            Err(CacheError::OutOfRange(_))
        ));

        let mut ok = memory_store(64, 2);
        ok.activate_streaming(ConsumePolicy::OnRead).unwrap();
        assert!(ok.is_streaming());

        ok.disable_streaming();
        assert!(!ok.is_streaming());
        assert_eq!(ok.consume_policy(), ConsumePolicy::None);
    }

    #[test]
    fn test_file_store_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.mc");
        let config = StoreConfig::bounded(1024, 4);

        {
            let mut store = SegmentStore::open_file(&path, &config).unwrap();
            store.write_content(0, b"persisted").unwrap();
            store.write_content(100, b"more").unwrap();
            store.close_all().unwrap();
        }

        {
            let mut store = SegmentStore::open_file(&path, &config).unwrap();
            assert_eq!(store.segment_count(), 2);
            assert_eq!(store.cached_size(), 13);

            let mut buf = [0u8; 9];
            store.read_content(0, &mut buf).unwrap();
            assert_eq!(&buf, b"persisted");

            let mut buf = [0u8; 4];
            store.read_content(100, &mut buf).unwrap();
            assert_eq!(&buf, b"more");
        }
    }

    #[test]
    fn test_corrupt_header_reinitializes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.mc");
        std::fs::write(&path, b"garbage that is not a cache container").unwrap();

        let store = SegmentStore::open_file(&path, &StoreConfig::bounded(1024, 4)).unwrap();
        assert_eq!(store.segment_count(), 0);
        store.check_invariants().unwrap();
    }

    #[test]
    fn test_close_all_idempotent() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, b"x").unwrap();

        store.close_all().unwrap();
        store.close_all().unwrap();
        assert_eq!(store.segment_count(), 0);
    }

    #[test]
    fn test_delete_content() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, b"doomed").unwrap();

        store.delete_content().unwrap();
        assert_eq!(store.segment_count(), 0);
        assert_eq!(store.cached_size(), 0);

        // The store is immediately reusable.
        store.write_content(0, b"fresh").unwrap();
        let mut buf = [0u8; 5];
        store.read_content(0, &mut buf).unwrap();
        assert_eq!(&buf, b"fresh");
    }

    #[test]
    fn test_coverage_queries() {
        let mut store = memory_store(1024, 4);
        store.write_content(200, &[2u8; 100]).unwrap();
        store.write_content(0, &[1u8; 100]).unwrap();

        let sorted = store.get_sorted_coverage(0, Some(300), true).unwrap();
        assert_eq!(
            sorted,
            vec![ByteRange::new(0, 100), ByteRange::new(200, 100)]
        );

        let missing = store.get_missing_coverage(0, Some(300)).unwrap();
        assert_eq!(missing, vec![ByteRange::new(100, 100)]);
    }

    #[test]
    fn test_sorted_coverage_merges_adjacent() {
        let mut store = memory_store(1024, 4);
        store.write_content(100, &[1u8; 50]).unwrap();
        store.write_content(0, &[1u8; 100]).unwrap();

        let unmerged = store.get_sorted_coverage(0, Some(150), false).unwrap();
        assert_eq!(unmerged.len(), 2);

        let merged = store.get_sorted_coverage(0, Some(150), true).unwrap();
        assert_eq!(merged, vec![ByteRange::new(0, 150)]);
    }

    #[test]
    fn test_missing_coverage_open_ended() {
        let mut store = memory_store(1024, 4);
        store.write_content(100, &[1u8; 50]).unwrap();

        let missing = store.get_missing_coverage(0, None).unwrap();
        assert_eq!(missing, vec![ByteRange::new(0, 100)]);
    }

    #[test]
    fn test_partial_coverage() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, &[1u8; 100]).unwrap();
        store.write_content(200, &[2u8; 100]).unwrap();

        let hit = store.get_partial_coverage(50, false);
        assert_eq!(
            hit,
            PartialCoverage {
                available: true,
                length: 50
            }
        );

        let gap = store.get_partial_coverage(150, false);
        assert_eq!(
            gap,
            PartialCoverage {
                available: false,
                length: 50
            }
        );

        let nothing_after = store.get_partial_coverage(400, false);
        assert_eq!(
            nothing_after,
            PartialCoverage {
                available: false,
                length: 0
            }
        );
    }

    #[test]
    fn test_partial_coverage_multi_segment() {
        let mut store = memory_store(1024, 4);
        store.write_content(0, &[1u8; 100]).unwrap();
        store.write_content(100, &[2u8; 50]).unwrap();

        // Written back to back, so the two ranges land in one segment; a
        // disjoint one follows after a gap.
        store.write_content(300, &[3u8; 10]).unwrap();

        let multi = store.get_partial_coverage(0, true);
        assert_eq!(
            multi,
            PartialCoverage {
                available: true,
                length: 150
            }
        );
    }
}

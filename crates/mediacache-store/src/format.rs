//! On-disk format constants for the cache container.

use serde::{Deserialize, Serialize};

/// Magic bytes identifying a segmented media cache container.
pub const MAGIC: [u8; 4] = *b"SMCF";

/// Current format version.
pub const VERSION: u8 = 1;

/// Fixed part of the header: magic (4) + version (1) + flags (1).
pub const HEADER_FIXED_SIZE: u64 = 6;

/// Default cap imposed when narrow offsets are combined with an unbounded
/// size, so that lengths always fit in 32 bits (2 MiB).
pub const NARROW_DEFAULT_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// Cap simulated for unbounded stores when reporting available space.
pub const SIMULATED_UNBOUNDED_CAP: u64 = 2047 * 1024 * 1024;

/// Extra bytes reserved by the memory backing beyond the configured
/// capacity, absorbing the transient overshoot of a streaming write that
/// straddles master and reserve.
pub const MEMORY_SLACK: usize = 4096;

/// Flags persisted in the header's flag byte.
///
/// Bit 0 selects 64-bit offset/length fields, bit 7 reserves one guard
/// byte before each segment's content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderFlags(pub u8);

impl HeaderFlags {
    /// 64-bit offset/length fields.
    pub const WIDE: u8 = 0b0000_0001;
    /// One guard byte precedes each segment's content.
    pub const GUARDS: u8 = 0b1000_0000;

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if offset/length fields are 64-bit.
    pub fn is_wide(&self) -> bool {
        self.0 & Self::WIDE != 0
    }

    /// Sets the wide-offsets flag.
    pub fn set_wide(&mut self, wide: bool) {
        if wide {
            self.0 |= Self::WIDE;
        } else {
            self.0 &= !Self::WIDE;
        }
    }

    /// Returns true if guard bytes are present.
    pub fn has_guards(&self) -> bool {
        self.0 & Self::GUARDS != 0
    }

    /// Sets the guard-bytes flag.
    pub fn set_guards(&mut self, guards: bool) {
        if guards {
            self.0 |= Self::GUARDS;
        } else {
            self.0 &= !Self::GUARDS;
        }
    }

    /// Width in bytes of the offset/length fields.
    pub fn field_width(&self) -> u64 {
        if self.is_wide() {
            8
        } else {
            4
        }
    }

    /// Number of guard bytes before each segment's content.
    pub fn guard_len(&self) -> u64 {
        if self.has_guards() {
            1
        } else {
            0
        }
    }

    /// Total header size: fixed part + max_size field + max_segments field.
    pub fn header_size(&self) -> u64 {
        HEADER_FIXED_SIZE + self.field_width() + 2
    }

    /// Size of one segment directory record: start + length + flag byte.
    pub fn record_size(&self) -> u64 {
        2 * self.field_width() + 1
    }
}

/// Flags persisted in each segment directory record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentFlags(pub u8);

impl SegmentFlags {
    /// Segment is the open, still-growing last segment; its length is not
    /// yet final on disk.
    pub const NEW: u8 = 0b0000_0001;
    /// Segment has had bytes consumed from its front and has a reserve.
    pub const DIRTY: u8 = 0b0000_0010;

    /// No flags set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns true if the new flag is set.
    pub fn is_new(&self) -> bool {
        self.0 & Self::NEW != 0
    }

    /// Sets the new flag.
    pub fn set_new(&mut self, new: bool) {
        if new {
            self.0 |= Self::NEW;
        } else {
            self.0 &= !Self::NEW;
        }
    }

    /// Returns true if the dirty flag is set.
    pub fn is_dirty(&self) -> bool {
        self.0 & Self::DIRTY != 0
    }

    /// Sets the dirty flag.
    pub fn set_dirty(&mut self, dirty: bool) {
        if dirty {
            self.0 |= Self::DIRTY;
        } else {
            self.0 &= !Self::DIRTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_flags_bits() {
        assert_eq!(HeaderFlags::WIDE, 0b0000_0001);
        assert_eq!(HeaderFlags::GUARDS, 0b1000_0000);
    }

    #[test]
    fn test_header_flags_wide() {
        let mut flags = HeaderFlags::empty();
        assert!(!flags.is_wide());
        assert_eq!(flags.field_width(), 4);

        flags.set_wide(true);
        assert!(flags.is_wide());
        assert_eq!(flags.field_width(), 8);

        flags.set_wide(false);
        assert!(!flags.is_wide());
    }

    #[test]
    fn test_header_flags_guards() {
        let mut flags = HeaderFlags::empty();
        assert_eq!(flags.guard_len(), 0);

        flags.set_guards(true);
        assert!(flags.has_guards());
        assert_eq!(flags.guard_len(), 1);
    }

    #[test]
    fn test_header_sizes() {
        let mut flags = HeaderFlags::empty();
        flags.set_wide(true);
        // 4 magic + 1 version + 1 flags + 8 max_size + 2 max_segments
        assert_eq!(flags.header_size(), 16);
        assert_eq!(flags.record_size(), 17);

        flags.set_wide(false);
        assert_eq!(flags.header_size(), 12);
        assert_eq!(flags.record_size(), 9);
    }

    #[test]
    fn test_segment_flags() {
        let mut flags = SegmentFlags::empty();
        assert!(!flags.is_new());
        assert!(!flags.is_dirty());

        flags.set_new(true);
        assert!(flags.is_new());
        assert!(!flags.is_dirty());

        flags.set_dirty(true);
        assert!(flags.is_new());
        assert!(flags.is_dirty());

        flags.set_new(false);
        assert!(!flags.is_new());
        assert!(flags.is_dirty());
        assert_eq!(flags.0, SegmentFlags::DIRTY);
    }
}

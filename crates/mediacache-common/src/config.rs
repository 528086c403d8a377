//! Configuration structures for the media cache engine.

use serde::{Deserialize, Serialize};

/// Configuration for a segment store instance.
///
/// `max_size` and `max_segments` are fixed at creation time and persisted
/// in the container header; they cannot shrink afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Maximum total content bytes the container may hold (0 = unbounded).
    pub max_size: u64,
    /// Maximum number of segment directory slots.
    pub max_segments: u16,
    /// Use 64-bit offset/length fields in the container (default).
    pub wide_offsets: bool,
    /// Reserve one guard byte before each segment's content.
    pub guard_bytes: bool,
    /// While streaming, drop all content when a write seeks to a position
    /// no segment can absorb.
    pub auto_delete_on_streaming: bool,
    /// While streaming, allow reads to be served from consumed bytes that
    /// are still physically present in a reserve's trailing space.
    pub empty_space_recovery: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_size: 0,
            max_segments: 32,
            wide_offsets: true,
            guard_bytes: false,
            auto_delete_on_streaming: true,
            empty_space_recovery: true,
        }
    }
}

impl StoreConfig {
    /// Returns a bounded configuration with the given content capacity.
    pub fn bounded(max_size: u64, max_segments: u16) -> Self {
        Self {
            max_size,
            max_segments,
            ..Default::default()
        }
    }
}

/// Policy deciding when consumed bytes are reclaimed while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsumePolicy {
    /// Never reclaim automatically (streaming off, or manual consumption).
    #[default]
    None,
    /// Reclaim the bytes covered by each successful read.
    OnRead,
    /// Reclaim just enough bytes ahead of each write to make it fit.
    OnWrite,
}

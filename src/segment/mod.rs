//! Immutable on-disk segments
//!
//! A segment holds one flush (or one compaction output): every buffered
//! series, each as a compressed run of points, plus an index locating the
//! runs. Segments are written once, renamed into place, and never
//! modified; compaction replaces them wholesale.

mod block;
mod builder;
mod reader;

pub use block::SeriesBlock;
pub use builder::SegmentBuilder;
pub use reader::SegmentReader;

use crate::{SequenceNumber, TimeRange, Timestamp};
use std::path::{Path, PathBuf};

/// Magic bytes at both ends of a segment file
pub const MAGIC: &[u8; 4] = b"TSDB";

/// Segment file format version
pub const FORMAT_VERSION: u32 = 1;

/// Unique, monotonically assigned segment identifier
pub type SegmentId = u64;

/// Segment metadata, kept in memory by the segment index.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// File path
    pub path: PathBuf,
    /// Unique ID
    pub id: SegmentId,
    /// Compaction level (0 = fresh flush)
    pub level: u32,
    /// Total points across all series
    pub point_count: usize,
    /// File size in bytes
    pub file_size: u64,
    /// Earliest timestamp in the segment
    pub min_timestamp: Timestamp,
    /// Latest timestamp in the segment
    pub max_timestamp: Timestamp,
    /// Highest sequence number of any point in the segment
    pub max_seq: SequenceNumber,
}

impl SegmentMeta {
    /// Whether the segment may hold points inside `range`
    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.min_timestamp <= range.end && self.max_timestamp >= range.start
    }
}

/// Segment writer configuration
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// LZ4 the Gorilla bitstream on top
    pub use_lz4: bool,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self { use_lz4: true }
    }
}

/// File name for a segment ID
pub fn segment_file_name(id: SegmentId) -> String {
    format!("segment_{:020}.seg", id)
}

/// Parse a segment ID back out of a file name
pub fn parse_segment_id(path: &Path) -> Option<SegmentId> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("segment_"))
        .and_then(|s| s.strip_suffix(".seg"))
        .and_then(|s| s.parse().ok())
}

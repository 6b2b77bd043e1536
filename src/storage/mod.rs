//! Storage engine

mod engine;

pub use engine::{MaintenanceHandle, Tsdb};

use crate::compaction::CompactionConfig;
use crate::segment::SegmentConfig;
use crate::wal::{SyncPolicy, WalConfig};
use crate::SequenceNumber;
use std::path::PathBuf;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Root data directory; WAL and segments live under it
    pub data_dir: PathBuf,
    /// Flush the buffer once it holds this many bytes
    pub buffer_size_limit: usize,
    /// WAL durability policy
    pub sync_policy: SyncPolicy,
    /// WAL segment size in bytes
    pub wal_segment_size: usize,
    /// Segment writer options
    pub segment: SegmentConfig,
    /// Compaction and retention options
    pub compaction: CompactionConfig,
}

impl DbConfig {
    /// Configuration rooted at `data_dir` with default limits
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            buffer_size_limit: crate::config::BUFFER_SIZE_LIMIT,
            sync_policy: SyncPolicy::default(),
            wal_segment_size: crate::config::WAL_SEGMENT_SIZE,
            segment: SegmentConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }

    pub(crate) fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub(crate) fn segments_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }

    pub(crate) fn wal_config(&self) -> WalConfig {
        WalConfig {
            dir: self.wal_dir(),
            sync_policy: self.sync_policy,
            segment_size: self.wal_segment_size,
        }
    }
}

/// Point-in-time engine statistics
#[derive(Debug, Clone, Default)]
pub struct DbStats {
    /// Distinct (series, timestamp) slots in the buffer
    pub buffer_points: usize,
    /// Approximate buffer footprint in bytes
    pub buffer_bytes: usize,
    /// Live segments on disk
    pub segment_count: usize,
    /// Total points across live segments
    pub segment_points: usize,
    /// Completed flushes since open
    pub flush_count: u64,
    /// Highest sequence number accepted
    pub last_seq: SequenceNumber,
}

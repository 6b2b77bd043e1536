//! tsdb - Embedded Time-Series Storage Engine
//!
//! An LSM-style storage engine for timestamped float samples:
//!
//! - **WAL (Write-Ahead Log)**: durability through sequential, checksummed
//!   appends; every point is recoverable before it reaches a segment.
//! - **Buffer**: lock-free in-memory skip list holding recent, unflushed
//!   points, queryable immediately.
//! - **Segments**: immutable on-disk files, sorted by series then timestamp,
//!   Gorilla-compressed and checksummed.
//! - **Segment index**: maps (series, time range) to the segments that may
//!   contain matching points, swapped atomically during compaction.
//! - **Query engine**: merges buffer and segment results, later write wins
//!   on timestamp ties, with optional aggregation.
//! - **Maintenance worker**: background flush, compaction, and retention.

pub mod buffer;
pub mod compaction;
pub mod compression;
pub mod index;
pub mod query;
pub mod segment;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{Result, TsdbError};
pub use storage::{DbConfig, DbStats, Tsdb};
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    use std::time::Duration;

    /// Maximum buffer size before flush (64MB)
    pub const BUFFER_SIZE_LIMIT: usize = 64 * 1024 * 1024;

    /// WAL segment size (16MB)
    pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;

    /// Number of level-0 segments that triggers compaction
    pub const L0_COMPACTION_TRIGGER: usize = 4;

    /// Default retention horizon (7 days)
    pub const RETENTION_HORIZON: Duration = Duration::from_secs(7 * 24 * 60 * 60);

    /// Maintenance worker tick interval
    pub const MAINTENANCE_TICK: Duration = Duration::from_secs(5);
}

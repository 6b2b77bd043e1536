//! Write-Ahead Log (WAL)
//!
//! The WAL makes every point durable before it becomes visible in the
//! buffer. Appends assign globally monotonic sequence numbers, so replay
//! after a crash is ordered and idempotent. Records are retired (old
//! segment files deleted) only after the buffer contents they cover have
//! been durably flushed into a segment.

mod entry;
mod reader;
mod writer;

pub use entry::{WalEntry, WalEntryKind};
pub use reader::{RecoveredWal, WalReader};
pub use writer::WalWriter;

use std::path::PathBuf;

/// WAL sync policy
#[derive(Debug, Clone, Copy)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync on interval (trades durability for performance)
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Immediate
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

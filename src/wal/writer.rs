//! WAL writer

use super::{SyncPolicy, WalConfig, WalEntry};
use crate::{Point, Result, SequenceNumber};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::debug;

/// WAL writer for appending entries to disk.
///
/// Appends serialize on an internal lock, which also assigns sequence
/// numbers, so WAL order and sequence order always agree.
pub struct WalWriter {
    config: WalConfig,
    inner: Mutex<WalWriterInner>,
}

struct WalWriterInner {
    file: BufWriter<File>,
    segment_id: u64,
    next_seq: SequenceNumber,
    bytes_written: usize,
    writes_since_sync: usize,
    last_sync: Instant,
}

impl WalWriter {
    /// Create a new WAL writer. `next_seq` seeds the sequence counter,
    /// typically one past the highest sequence recovered during replay.
    pub fn new(config: WalConfig, next_seq: SequenceNumber) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;

        // Start a fresh segment rather than appending to the previous
        // run's file: its tail may be torn, and entries written after a
        // torn tail would be unreachable to replay.
        let segment_id = match Self::find_latest_segment(&config.dir)? {
            Some(latest) => latest + 1,
            None => 0,
        };
        let file = Self::open_segment(&config.dir, segment_id)?;
        let bytes_written = 0;

        let inner = WalWriterInner {
            file: BufWriter::new(file),
            segment_id,
            next_seq,
            bytes_written,
            writes_since_sync: 0,
            last_sync: Instant::now(),
        };

        Ok(Self {
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Append a batch of points; durable per the sync policy before return.
    /// Returns the sequence number assigned to the first point; subsequent
    /// points in the batch take consecutive numbers.
    pub fn append(&self, points: &[Point]) -> Result<SequenceNumber> {
        let mut inner = self.inner.lock();

        let first_seq = inner.next_seq;
        let entry = WalEntry::write(first_seq, points)?;
        self.write_entry(&mut inner, &entry)?;
        inner.next_seq = first_seq + points.len() as u64;

        debug!(first_seq, count = points.len(), "wal append");
        Ok(first_seq)
    }

    /// Append a flush checkpoint covering all sequences up to `seq`.
    pub fn checkpoint(&self, seq: SequenceNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = WalEntry::checkpoint(seq);
        self.write_entry(&mut inner, &entry)?;
        self.sync_inner(&mut inner)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sync_inner(&mut inner)
    }

    /// Get current segment ID
    pub fn current_segment(&self) -> u64 {
        self.inner.lock().segment_id
    }

    /// Force rotation to a fresh segment file and return its ID. Called by
    /// the engine at the start of a flush so that every entry covering the
    /// flushed snapshot lives in a strictly older file.
    pub fn rotate(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.rotate_segment(&mut inner)?;
        Ok(inner.segment_id)
    }

    /// Delete WAL segment files strictly older than `segment_id`; called
    /// after the corresponding buffer contents are durably in a segment.
    pub fn truncate_before(&self, segment_id: u64) -> Result<usize> {
        let mut truncated = 0;
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = Self::parse_segment_id(&path) {
                if id < segment_id {
                    fs::remove_file(&path)?;
                    truncated += 1;
                }
            }
        }
        Ok(truncated)
    }

    fn write_entry(&self, inner: &mut WalWriterInner, entry: &WalEntry) -> Result<()> {
        let serialized = entry.serialize_with_checksum();

        if inner.bytes_written + serialized.len() > self.config.segment_size {
            self.rotate_segment(inner)?;
        }

        inner.file.write_all(&serialized)?;
        inner.bytes_written += serialized.len();
        inner.writes_since_sync += 1;

        if self.should_sync(inner) {
            self.sync_inner(inner)?;
        }

        Ok(())
    }

    fn sync_inner(&self, inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        inner.last_sync = Instant::now();
        Ok(())
    }

    fn should_sync(&self, inner: &WalWriterInner) -> bool {
        match self.config.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => inner.writes_since_sync >= n,
            SyncPolicy::Interval { millis } => {
                inner.last_sync.elapsed().as_millis() >= millis as u128
            }
            SyncPolicy::None => false,
        }
    }

    fn rotate_segment(&self, inner: &mut WalWriterInner) -> Result<()> {
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;

        inner.segment_id += 1;
        let file = Self::open_segment(&self.config.dir, inner.segment_id)?;
        inner.file = BufWriter::new(file);
        inner.bytes_written = 0;
        inner.writes_since_sync = 0;

        Ok(())
    }

    fn find_latest_segment(dir: &Path) -> Result<Option<u64>> {
        let mut max_id = None;
        if dir.exists() {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                if let Some(id) = Self::parse_segment_id(&entry.path()) {
                    max_id = Some(max_id.map_or(id, |m: u64| m.max(id)));
                }
            }
        }
        Ok(max_id)
    }

    fn open_segment(dir: &Path, segment_id: u64) -> Result<File> {
        let path = dir.join(format!("wal_{:020}.log", segment_id));
        Ok(OpenOptions::new().create(true).append(true).open(&path)?)
    }

    pub(super) fn parse_segment_id(path: &Path) -> Option<u64> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(|s| s.strip_prefix("wal_"))
            .and_then(|s| s.strip_suffix(".log"))
            .and_then(|s| s.parse().ok())
    }
}

//! WAL reader for recovery

use super::{WalEntry, WalEntryKind, WalWriter};
use crate::{Point, Result, SequenceNumber, TsdbError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// State reconstructed from the WAL during startup.
#[derive(Debug, Default)]
pub struct RecoveredWal {
    /// Unflushed points with their assigned sequence numbers, in WAL order
    pub points: Vec<(SequenceNumber, Point)>,
    /// Highest checkpoint seen, if any; everything at or below it is in
    /// segments. Sequences start at 0, so "no checkpoint" must stay
    /// distinct from "checkpoint at 0".
    pub checkpoint: Option<SequenceNumber>,
    /// Sequence counter seed for the new writer
    pub next_seq: SequenceNumber,
}

/// WAL reader for replaying entries after a restart or crash.
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    /// Create a new WAL reader
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Replay all WAL segments in order.
    ///
    /// A torn or corrupt entry ends replay of its segment at the last good
    /// entry; everything before it is kept. Points already covered by a
    /// checkpoint are dropped, so replaying after a clean flush is a no-op.
    pub fn replay(&self) -> Result<RecoveredWal> {
        let mut recovered = RecoveredWal::default();

        if !self.dir.exists() {
            return Ok(recovered);
        }

        let segments = self.find_segments()?;
        for (segment_id, path) in &segments {
            self.read_segment(*segment_id, path, &mut recovered)?;
        }

        // Checkpointed points are already durable in segments
        if let Some(checkpoint) = recovered.checkpoint {
            recovered.points.retain(|(seq, _)| *seq > checkpoint);
            recovered.next_seq = recovered.next_seq.max(checkpoint + 1);
        }

        if !recovered.points.is_empty() {
            info!(
                points = recovered.points.len(),
                next_seq = recovered.next_seq,
                "recovered unflushed points from wal"
            );
        }

        Ok(recovered)
    }

    fn read_segment(
        &self,
        segment_id: u64,
        path: &Path,
        recovered: &mut RecoveredWal,
    ) -> Result<()> {
        let data = fs::read(path)?;
        let mut offset = 0;

        while offset < data.len() {
            match WalEntry::deserialize_with_checksum(&data[offset..]) {
                Ok((entry, consumed)) => {
                    offset += consumed;
                    self.apply_entry(&entry, recovered)?;
                }
                Err(TsdbError::ChecksumMismatch { .. }) => {
                    warn!(
                        segment_id,
                        offset, "checksum mismatch in wal, stopping replay of segment"
                    );
                    break;
                }
                Err(TsdbError::InvalidFormat(_)) => {
                    // Torn tail from a crash mid-append
                    warn!(segment_id, offset, "incomplete wal entry, truncating replay");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn apply_entry(&self, entry: &WalEntry, recovered: &mut RecoveredWal) -> Result<()> {
        match entry.kind {
            WalEntryKind::Write => {
                let points = entry.points()?;
                for (i, point) in points.into_iter().enumerate() {
                    let seq = entry.first_seq + i as u64;
                    recovered.next_seq = recovered.next_seq.max(seq + 1);
                    recovered.points.push((seq, point));
                }
            }
            WalEntryKind::Checkpoint => {
                recovered.checkpoint = Some(match recovered.checkpoint {
                    Some(existing) => existing.max(entry.first_seq),
                    None => entry.first_seq,
                });
                recovered.next_seq = recovered.next_seq.max(entry.first_seq + 1);
            }
        }
        Ok(())
    }

    fn find_segments(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if let Some(id) = WalWriter::parse_segment_id(&path) {
                segments.push((id, path));
            }
        }
        segments.sort_by_key(|(id, _)| *id);
        Ok(segments)
    }
}

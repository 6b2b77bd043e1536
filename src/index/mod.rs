//! In-memory segment index
//!
//! Tracks every live segment and answers "which segments could hold
//! points for this series and range". Compaction swaps its outputs in
//! and its inputs out under one write lock, so queries always see
//! either the old set or the new set, never a mix.

use crate::segment::{SegmentId, SegmentMeta, SegmentReader};
use crate::{Result, SeriesKey, TimeRange};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Registry of open segment readers, ordered by segment ID.
pub struct SegmentIndex {
    segments: RwLock<BTreeMap<SegmentId, Arc<SegmentReader>>>,
}

impl SegmentIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            segments: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a newly flushed segment
    pub fn register(&self, reader: Arc<SegmentReader>) {
        let mut segments = self.segments.write();
        segments.insert(reader.meta().id, reader);
    }

    /// Atomically swap compaction outputs for their inputs. Readers that
    /// grabbed the old set keep their `Arc`s, so in-flight queries finish
    /// against the segments they started with.
    pub fn apply(&self, added: Vec<Arc<SegmentReader>>, removed: &[SegmentId]) {
        let mut segments = self.segments.write();
        for id in removed {
            segments.remove(id);
        }
        for reader in added {
            segments.insert(reader.meta().id, reader);
        }
        info!(live = segments.len(), removed = removed.len(), "segment set updated");
    }

    /// Segments that may hold points for `series` inside `range`, oldest
    /// first. Pruned by time overlap and series presence.
    pub fn lookup(&self, series: &SeriesKey, range: &TimeRange) -> Vec<Arc<SegmentReader>> {
        self.segments
            .read()
            .values()
            .filter(|r| r.meta().overlaps(range))
            .filter(|r| r.contains_series(series))
            .cloned()
            .collect()
    }

    /// All live segments, oldest first
    pub fn all(&self) -> Vec<Arc<SegmentReader>> {
        self.segments.read().values().cloned().collect()
    }

    /// Metadata for every live segment, oldest first
    pub fn metas(&self) -> Vec<SegmentMeta> {
        self.segments
            .read()
            .values()
            .map(|r| r.meta().clone())
            .collect()
    }

    /// Number of live segments
    pub fn len(&self) -> usize {
        self.segments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.read().is_empty()
    }

    /// Highest registered segment ID, if any
    pub fn max_id(&self) -> Option<SegmentId> {
        self.segments.read().keys().next_back().copied()
    }

    /// Open every segment file in `dir` and register it. Leftover `.tmp`
    /// files from an interrupted flush or compaction are removed.
    pub fn load_dir(&self, dir: &std::path::Path) -> Result<usize> {
        if !dir.exists() {
            return Ok(0);
        }

        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();

            if path.extension().is_some_and(|ext| ext == "tmp") {
                std::fs::remove_file(&path)?;
                continue;
            }
            if crate::segment::parse_segment_id(&path).is_none() {
                continue;
            }

            let reader = Arc::new(SegmentReader::open(path)?);
            self.register(reader);
            loaded += 1;
        }

        if loaded > 0 {
            info!(segments = loaded, "loaded segments from disk");
        }
        Ok(loaded)
    }
}

impl Default for SegmentIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment_file_name, SegmentBuilder, SegmentConfig};
    use tempfile::TempDir;

    fn build_segment(dir: &std::path::Path, id: u64, series: &str, ts: i64) -> Arc<SegmentReader> {
        let path = dir.join(segment_file_name(id));
        let mut builder = SegmentBuilder::new(path.clone(), id, 0, SegmentConfig::default());
        builder
            .add_series(SeriesKey::new(series), &[(ts, 1.0, id)])
            .unwrap();
        builder.finish().unwrap();
        Arc::new(SegmentReader::open(path).unwrap())
    }

    #[test]
    fn test_lookup_prunes_by_series_and_time() {
        let temp_dir = TempDir::new().unwrap();
        let index = SegmentIndex::new();
        index.register(build_segment(temp_dir.path(), 1, "cpu", 100));
        index.register(build_segment(temp_dir.path(), 2, "mem", 100));
        index.register(build_segment(temp_dir.path(), 3, "cpu", 500));

        let cpu = SeriesKey::new("cpu");
        let hits = index.lookup(&cpu, &TimeRange::new(0, 200));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].meta().id, 1);

        let hits = index.lookup(&cpu, &TimeRange::all());
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_apply_swaps_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let index = SegmentIndex::new();
        index.register(build_segment(temp_dir.path(), 1, "cpu", 100));
        index.register(build_segment(temp_dir.path(), 2, "cpu", 200));

        let merged = build_segment(temp_dir.path(), 3, "cpu", 100);
        index.apply(vec![merged], &[1, 2]);

        assert_eq!(index.len(), 1);
        assert_eq!(index.max_id(), Some(3));
    }

    #[test]
    fn test_load_dir_cleans_tmp_files() {
        let temp_dir = TempDir::new().unwrap();
        build_segment(temp_dir.path(), 1, "cpu", 100);
        build_segment(temp_dir.path(), 2, "mem", 100);
        let tmp = temp_dir.path().join("segment_00000000000000000003.tmp");
        std::fs::write(&tmp, b"partial").unwrap();

        let index = SegmentIndex::new();
        let loaded = index.load_dir(temp_dir.path()).unwrap();
        assert_eq!(loaded, 2);
        assert!(!tmp.exists());
    }
}

//! Compaction and retention
//!
//! Flushes accumulate small level-0 segments; once enough exist they are
//! merged into one higher-level segment, resolving duplicate
//! (series, timestamp) slots by sequence number. Retention drops whole
//! segments whose newest point has aged past the horizon. Both run from
//! the maintenance loop and swap the live segment set atomically, so
//! queries before, during, and after a pass see the same data.

use crate::index::SegmentIndex;
use crate::segment::{
    segment_file_name, SegmentBuilder, SegmentConfig, SegmentId, SegmentReader,
};
use crate::{Result, SequenceNumber, SeriesKey, Timestamp, TsdbError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Compaction and retention configuration
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Merge level-0 segments once this many exist
    pub l0_trigger: usize,
    /// Drop segments entirely older than this
    pub retention: Duration,
    /// Maintenance loop period
    pub tick_interval: Duration,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            l0_trigger: crate::config::L0_COMPACTION_TRIGGER,
            retention: crate::config::RETENTION_HORIZON,
            tick_interval: crate::config::MAINTENANCE_TICK,
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    /// Segments merged away by compaction
    pub segments_compacted: usize,
    /// Segments dropped by retention
    pub segments_expired: usize,
}

/// Merges level-0 segments and enforces retention.
pub struct Compactor {
    config: CompactionConfig,
    index: Arc<SegmentIndex>,
    data_dir: PathBuf,
    segment_config: SegmentConfig,
    next_segment_id: Arc<AtomicU64>,
    // Held for the duration of a pass; ticks that arrive mid-pass skip
    running: Mutex<()>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        index: Arc<SegmentIndex>,
        data_dir: PathBuf,
        segment_config: SegmentConfig,
        next_segment_id: Arc<AtomicU64>,
    ) -> Self {
        Self {
            config,
            index,
            data_dir,
            segment_config,
            next_segment_id,
            running: Mutex::new(()),
        }
    }

    /// Run one retention-then-compaction pass. `now` is nanoseconds since
    /// the Unix epoch; retention is judged against it.
    pub fn run_once(&self, now: Timestamp) -> Result<CompactionStats> {
        let Some(_guard) = self.running.try_lock() else {
            return Ok(CompactionStats::default());
        };

        let mut stats = CompactionStats::default();
        stats.segments_expired = self.run_retention(now)?;
        stats.segments_compacted = self.run_compaction()?;
        Ok(stats)
    }

    /// Drop every segment whose newest point is past the horizon.
    fn run_retention(&self, now: Timestamp) -> Result<usize> {
        // Saturate: a horizon wider than i64 nanoseconds never expires
        let retention_nanos =
            i64::try_from(self.config.retention.as_nanos()).unwrap_or(i64::MAX);
        let Some(horizon) = now.checked_sub(retention_nanos) else {
            return Ok(0);
        };

        let expired: Vec<_> = self
            .index
            .metas()
            .into_iter()
            .filter(|meta| meta.max_timestamp < horizon)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let ids: Vec<SegmentId> = expired.iter().map(|m| m.id).collect();
        self.index.apply(vec![], &ids);

        for meta in &expired {
            if let Err(e) = std::fs::remove_file(&meta.path) {
                warn!(path = %meta.path.display(), error = %e, "failed to remove expired segment");
            }
        }

        info!(expired = expired.len(), horizon, "retention pass complete");
        Ok(expired.len())
    }

    /// Merge all level-0 segments into one segment at the next level once
    /// enough have accumulated.
    fn run_compaction(&self) -> Result<usize> {
        let inputs: Vec<Arc<SegmentReader>> = self
            .index
            .all()
            .into_iter()
            .filter(|r| r.meta().level == 0)
            .collect();
        if inputs.len() < self.config.l0_trigger {
            return Ok(0);
        }

        let merged = self.merge_inputs(&inputs)?;
        let output_id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.data_dir.join(segment_file_name(output_id));

        let mut builder = SegmentBuilder::new(path.clone(), output_id, 1, self.segment_config.clone());
        for (series, points) in merged {
            builder.add_series(series, &points)?;
        }

        let input_ids: Vec<SegmentId> = inputs.iter().map(|r| r.meta().id).collect();
        if builder.is_empty() {
            // All input data was duplicate-shadowed away; nothing to write
            self.index.apply(vec![], &input_ids);
        } else {
            let meta = builder.finish()?;
            let reader = Arc::new(
                SegmentReader::open(meta.path.clone())
                    .map_err(|e| TsdbError::Compaction(e.to_string()))?,
            );
            self.index.apply(vec![reader], &input_ids);
        }

        for reader in &inputs {
            if let Err(e) = std::fs::remove_file(&reader.meta().path) {
                warn!(path = %reader.meta().path.display(), error = %e, "failed to remove compacted segment");
            }
        }

        info!(
            inputs = inputs.len(),
            output = output_id,
            "compacted level-0 segments"
        );
        Ok(inputs.len())
    }

    /// Merge input segments series by series. Duplicate slots keep the
    /// value with the highest sequence number.
    fn merge_inputs(
        &self,
        inputs: &[Arc<SegmentReader>],
    ) -> Result<BTreeMap<SeriesKey, Vec<(Timestamp, f64, SequenceNumber)>>> {
        let mut slots: BTreeMap<SeriesKey, BTreeMap<Timestamp, (f64, SequenceNumber)>> =
            BTreeMap::new();

        for reader in inputs {
            for (series, points) in reader.read_all()? {
                let series_slots = slots.entry(series).or_default();
                for (ts, value, seq) in points {
                    match series_slots.get(&ts) {
                        Some((_, existing)) if *existing >= seq => {}
                        _ => {
                            series_slots.insert(ts, (value, seq));
                        }
                    }
                }
            }
        }

        Ok(slots
            .into_iter()
            .map(|(series, points)| {
                let run = points
                    .into_iter()
                    .map(|(ts, (value, seq))| (ts, value, seq))
                    .collect();
                (series, run)
            })
            .collect())
    }
}

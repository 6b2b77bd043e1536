//! The storage engine façade
//!
//! Ties together WAL, buffer, segments, index, query engine, and
//! compaction. Writes hit the WAL before the buffer; a flush swaps the
//! buffer out under a write lock after rotating the WAL, so the
//! checkpoint it records is exact and recovery never drops an
//! acknowledged point.

use super::{DbConfig, DbStats};
use crate::buffer::Buffer;
use crate::compaction::{CompactionStats, Compactor};
use crate::index::SegmentIndex;
use crate::query;
use crate::segment::{segment_file_name, SegmentBuilder, SegmentMeta, SegmentReader};
use crate::wal::{WalReader, WalWriter};
use crate::{
    Aggregate, Point, Result, SequenceNumber, SeriesKey, TimeRange, Timestamp, TsdbError,
};
use parking_lot::RwLock;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Time-series storage engine.
///
/// All methods take `&self`; the engine is safe to share behind an
/// `Arc` across threads and tasks.
pub struct Tsdb {
    config: DbConfig,
    wal: WalWriter,
    buffer: RwLock<Arc<Buffer>>,
    index: Arc<SegmentIndex>,
    compactor: Compactor,
    next_segment_id: Arc<AtomicU64>,
    flush_count: AtomicU64,
    last_seq: AtomicU64,
}

impl Tsdb {
    /// Open the engine, recovering any unflushed points from the WAL.
    pub fn open(config: DbConfig) -> Result<Self> {
        std::fs::create_dir_all(config.segments_dir())?;

        let index = Arc::new(SegmentIndex::new());
        index.load_dir(&config.segments_dir())?;

        let recovered = WalReader::new(config.wal_dir()).replay()?;
        let buffer = Buffer::new();
        let mut last_seq = recovered.checkpoint.unwrap_or(0);
        for (seq, point) in recovered.points {
            last_seq = last_seq.max(seq);
            buffer.insert(point, seq);
        }

        let wal = WalWriter::new(config.wal_config(), recovered.next_seq)?;
        let next_segment_id = Arc::new(AtomicU64::new(
            index.max_id().map(|id| id + 1).unwrap_or(1),
        ));

        let compactor = Compactor::new(
            config.compaction.clone(),
            Arc::clone(&index),
            config.segments_dir(),
            config.segment.clone(),
            Arc::clone(&next_segment_id),
        );

        info!(
            data_dir = %config.data_dir.display(),
            segments = index.len(),
            recovered_points = buffer.len(),
            "engine opened"
        );

        Ok(Self {
            config,
            wal,
            buffer: RwLock::new(Arc::new(buffer)),
            index,
            compactor,
            next_segment_id,
            flush_count: AtomicU64::new(0),
            last_seq: AtomicU64::new(last_seq),
        })
    }

    /// Write a single point. Durable per the sync policy on return.
    pub fn write(&self, point: Point) -> Result<SequenceNumber> {
        self.write_batch(std::slice::from_ref(&point))
    }

    /// Write a batch of points atomically with respect to recovery: the
    /// batch is one WAL entry, so after a crash either all of it or a
    /// clean prefix-free none of it is replayed.
    pub fn write_batch(&self, points: &[Point]) -> Result<SequenceNumber> {
        if points.is_empty() {
            return Ok(self.last_seq.load(Ordering::Relaxed));
        }

        // Holding the read guard keeps a flush from swapping the buffer
        // between the WAL append and the insert, which is what makes the
        // flush checkpoint exact.
        let first_seq = {
            let buffer = self.buffer.read();
            let first_seq = self.wal.append(points)?;
            buffer.insert_batch(points, first_seq);
            first_seq
        };

        let last = first_seq + points.len() as u64 - 1;
        self.last_seq.fetch_max(last, Ordering::Relaxed);

        if self
            .buffer
            .read()
            .should_flush(self.config.buffer_size_limit)
        {
            self.flush()?;
        }

        Ok(first_seq)
    }

    /// Flush the buffer into a new level-0 segment. Returns `None` when
    /// there was nothing to flush.
    pub fn flush(&self) -> Result<Option<SegmentMeta>> {
        let (snapshot, wal_cutoff) = {
            let mut buffer = self.buffer.write();
            if buffer.is_empty() {
                return Ok(None);
            }
            // Rotate first: every WAL entry covering the snapshot now
            // lives in a file older than the cutoff.
            let cutoff = self.wal.rotate()?;
            let snapshot = mem::replace(&mut *buffer, Arc::new(Buffer::new()));
            (snapshot, cutoff)
        };

        let max_seq = snapshot.max_seq();
        let id = self.next_segment_id.fetch_add(1, Ordering::SeqCst);
        let path = self.config.segments_dir().join(segment_file_name(id));

        let mut builder = SegmentBuilder::new(path, id, 0, self.config.segment.clone());
        for (series, points) in snapshot.snapshot() {
            builder.add_series(series, &points)?;
        }
        let meta = builder.finish()?;

        let reader = Arc::new(SegmentReader::open(meta.path.clone())?);
        self.index.register(reader);

        // Only now is it safe to retire the WAL entries behind the flush
        self.wal.checkpoint(max_seq)?;
        self.wal.truncate_before(wal_cutoff)?;
        self.flush_count.fetch_add(1, Ordering::Relaxed);

        info!(
            segment = id,
            points = meta.point_count,
            max_seq,
            "buffer flushed"
        );
        Ok(Some(meta))
    }

    /// Query one series over an inclusive time range. Results are sorted
    /// by timestamp with one value per timestamp, merged across the
    /// buffer and all overlapping segments.
    pub fn query(&self, series: &SeriesKey, range: TimeRange) -> Result<Vec<(Timestamp, f64)>> {
        let buffer = Arc::clone(&self.buffer.read());

        let mut sources = vec![buffer.query(series, range)];
        for reader in self.index.lookup(series, &range) {
            sources.push(reader.read(series, &range)?);
        }

        Ok(query::merge_points(sources))
    }

    /// Aggregate a series over a range down to a single value.
    pub fn query_aggregate(
        &self,
        series: &SeriesKey,
        range: TimeRange,
        agg: Aggregate,
    ) -> Result<Option<f64>> {
        let points = self.query(series, range)?;
        Ok(query::aggregate(&points, agg))
    }

    /// Aggregate a series into fixed-width windows aligned to the range
    /// start. `window` is in nanoseconds.
    pub fn query_windows(
        &self,
        series: &SeriesKey,
        range: TimeRange,
        agg: Aggregate,
        window: i64,
    ) -> Result<Vec<(Timestamp, f64)>> {
        if window <= 0 {
            return Err(TsdbError::Config(format!(
                "Window must be positive, got {}",
                window
            )));
        }
        let points = self.query(series, range)?;
        Ok(query::window_aggregate(&points, range.start, window, agg))
    }

    /// Run one retention-then-compaction pass immediately.
    pub fn compact(&self) -> Result<CompactionStats> {
        self.compactor.run_once(now_nanos())
    }

    /// Flush and sync everything; call before dropping the engine for a
    /// clean shutdown (recovery handles the unclean case).
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.wal.sync()
    }

    /// Engine statistics
    pub fn stats(&self) -> DbStats {
        let buffer = Arc::clone(&self.buffer.read());
        let metas = self.index.metas();

        DbStats {
            buffer_points: buffer.len(),
            buffer_bytes: buffer.size_bytes(),
            segment_count: metas.len(),
            segment_points: metas.iter().map(|m| m.point_count).sum(),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            last_seq: self.last_seq.load(Ordering::Relaxed),
        }
    }

    /// Spawn the background maintenance loop: periodic flush checks,
    /// retention, and compaction. Returns a handle used to stop it.
    pub fn spawn_maintenance(self: &Arc<Self>) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let db = Arc::clone(self);
        let tick = db.config.compaction.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = db.maintenance_pass() {
                            error!(error = %e, "maintenance pass failed");
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        MaintenanceHandle {
            shutdown: shutdown_tx,
            handle,
        }
    }

    fn maintenance_pass(&self) -> Result<()> {
        if self
            .buffer
            .read()
            .should_flush(self.config.buffer_size_limit)
        {
            self.flush()?;
        }
        self.compactor.run_once(now_nanos())?;
        Ok(())
    }
}

/// Handle to the background maintenance task.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn now_nanos() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &std::path::Path) -> Tsdb {
        Tsdb::open(DbConfig::new(dir)).unwrap()
    }

    fn cpu() -> SeriesKey {
        SeriesKey::new("cpu").with_tag("host", "a")
    }

    #[test]
    fn test_write_and_query() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        for ts in 1..=5 {
            db.write(Point::new(cpu(), ts, ts as f64 * 10.0)).unwrap();
        }

        let points = db.query(&cpu(), TimeRange::new(2, 4)).unwrap();
        assert_eq!(points, vec![(2, 20.0), (3, 30.0), (4, 40.0)]);
    }

    #[test]
    fn test_query_spans_buffer_and_segment() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        db.write(Point::new(cpu(), 1, 1.0)).unwrap();
        db.write(Point::new(cpu(), 2, 2.0)).unwrap();
        let meta = db.flush().unwrap().unwrap();
        assert_eq!(meta.point_count, 2);

        db.write(Point::new(cpu(), 3, 3.0)).unwrap();

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0), (2, 2.0), (3, 3.0)]);
    }

    #[test]
    fn test_overwrite_across_flush() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        db.write(Point::new(cpu(), 100, 1.0)).unwrap();
        db.flush().unwrap();
        db.write(Point::new(cpu(), 100, 2.0)).unwrap();

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(100, 2.0)]);

        // Newer value survives its own flush too
        db.flush().unwrap();
        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(100, 2.0)]);
    }

    #[test]
    fn test_recovery_after_unclean_drop() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = open(temp_dir.path());
            db.write(Point::new(cpu(), 1, 1.0)).unwrap();
            db.write(Point::new(cpu(), 2, 2.0)).unwrap();
            // Dropped without close(): buffer contents only in the WAL
        }

        let db = open(temp_dir.path());
        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0), (2, 2.0)]);

        let stats = db.stats();
        assert_eq!(stats.buffer_points, 2);
        assert_eq!(stats.segment_count, 0);
    }

    #[test]
    fn test_stats() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        db.write(Point::new(cpu(), 1, 1.0)).unwrap();
        db.write(Point::new(cpu(), 2, 2.0)).unwrap();
        db.flush().unwrap();
        db.write(Point::new(cpu(), 3, 3.0)).unwrap();

        let stats = db.stats();
        assert_eq!(stats.buffer_points, 1);
        assert_eq!(stats.segment_count, 1);
        assert_eq!(stats.segment_points, 2);
        assert_eq!(stats.flush_count, 1);
        assert_eq!(stats.last_seq, 2);
    }

    #[test]
    fn test_windowed_query_rejects_bad_window() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());
        let result = db.query_windows(&cpu(), TimeRange::all(), Aggregate::Mean, 0);
        assert!(matches!(result, Err(TsdbError::Config(_))));
    }

    #[test]
    fn test_flush_is_invisible_to_queries() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        for ts in 1..=5 {
            db.write(Point::new(cpu(), ts, ts as f64)).unwrap();
        }
        let before = db.query(&cpu(), TimeRange::new(2, 4)).unwrap();
        assert_eq!(before, vec![(2, 2.0), (3, 3.0), (4, 4.0)]);

        db.flush().unwrap();
        let after = db.query(&cpu(), TimeRange::new(2, 4)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_compaction_is_invisible_to_queries() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let mut config = DbConfig::new(temp_dir.path());
        config.compaction.l0_trigger = 2;
        // Epoch-adjacent test timestamps must not age out against now
        config.compaction.retention = std::time::Duration::MAX;
        let db = Tsdb::open(config).unwrap();

        db.write(Point::new(cpu(), 100, 1.0)).unwrap();
        db.write(Point::new(cpu(), 200, 2.0)).unwrap();
        db.flush().unwrap();
        // Overwrite t=200 in a second segment
        db.write(Point::new(cpu(), 200, 9.0)).unwrap();
        db.write(Point::new(cpu(), 300, 3.0)).unwrap();
        db.flush().unwrap();

        let before = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(before, vec![(100, 1.0), (200, 9.0), (300, 3.0)]);

        let stats = db.compact().unwrap();
        assert_eq!(stats.segments_compacted, 2);
        assert_eq!(db.stats().segment_count, 1);

        let after = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_reopen_twice_does_not_duplicate() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = open(temp_dir.path());
            db.write(Point::new(cpu(), 1, 1.0)).unwrap();
        }
        {
            // Replay without flushing, then drop again
            let db = open(temp_dir.path());
            assert_eq!(db.stats().buffer_points, 1);
        }

        let db = open(temp_dir.path());
        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0)]);
    }

    #[test]
    fn test_flush_then_crash_does_not_replay_flushed_points() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = open(temp_dir.path());
            db.write(Point::new(cpu(), 1, 1.0)).unwrap();
            db.flush().unwrap();
            db.write(Point::new(cpu(), 2, 2.0)).unwrap();
        }

        let db = open(temp_dir.path());
        let stats = db.stats();
        assert_eq!(stats.buffer_points, 1, "only the unflushed point replays");
        assert_eq!(stats.segment_count, 1);

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0), (2, 2.0)]);
    }

    #[test]
    fn test_crash_mid_flush_recovers_from_wal() {
        let temp_dir = TempDir::new().unwrap();
        {
            let db = open(temp_dir.path());
            db.write(Point::new(cpu(), 1, 1.0)).unwrap();
            db.write(Point::new(cpu(), 2, 2.0)).unwrap();
            // Dropped without flush: the points exist only in the WAL
        }

        // A crash between the buffer swap and the segment rename leaves
        // an orphan temp file, no visible segment, and no checkpoint
        let orphan = temp_dir
            .path()
            .join("segments")
            .join("segment_00000000000000000001.tmp");
        std::fs::write(&orphan, b"interrupted flush").unwrap();

        let db = open(temp_dir.path());
        assert!(!orphan.exists(), "orphan temp file must be swept on open");

        let stats = db.stats();
        assert_eq!(stats.segment_count, 0);
        assert_eq!(stats.buffer_points, 2);

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0), (2, 2.0)]);
    }

    #[test]
    fn test_aggregates_across_sources() {
        let temp_dir = TempDir::new().unwrap();
        let db = open(temp_dir.path());

        for ts in 1..=4 {
            db.write(Point::new(cpu(), ts, ts as f64)).unwrap();
        }
        db.flush().unwrap();
        db.write(Point::new(cpu(), 5, 5.0)).unwrap();

        let range = TimeRange::new(1, 5);
        assert_eq!(
            db.query_aggregate(&cpu(), range, Aggregate::Sum).unwrap(),
            Some(15.0)
        );
        assert_eq!(
            db.query_aggregate(&cpu(), range, Aggregate::Mean).unwrap(),
            Some(3.0)
        );

        let windows = db
            .query_windows(&cpu(), range, Aggregate::Count, 2)
            .unwrap();
        assert_eq!(windows, vec![(1, 2.0), (3, 2.0), (5, 1.0)]);
    }

    #[test]
    fn test_randomized_roundtrip_through_flush_and_compaction() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        use std::collections::BTreeMap;

        let temp_dir = TempDir::new().unwrap();
        let mut config = DbConfig::new(temp_dir.path());
        config.compaction.l0_trigger = 2;
        config.compaction.retention = std::time::Duration::MAX;
        let db = Tsdb::open(config).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        let mut expected: BTreeMap<Timestamp, f64> = BTreeMap::new();

        for round in 0..6 {
            for _ in 0..200 {
                let ts = rng.gen_range(0..500);
                let value = rng.gen_range(-1000.0..1000.0);
                expected.insert(ts, value);
                db.write(Point::new(cpu(), ts, value)).unwrap();
            }
            if round % 2 == 1 {
                db.flush().unwrap();
                db.compact().unwrap();
            }
        }

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        let got: BTreeMap<Timestamp, f64> = points.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_maintenance_loop_compacts_and_stops() {
        init_tracing();
        let temp_dir = TempDir::new().unwrap();
        let mut config = DbConfig::new(temp_dir.path());
        config.compaction.l0_trigger = 2;
        config.compaction.retention = std::time::Duration::MAX;
        config.compaction.tick_interval = std::time::Duration::from_millis(10);
        let db = Arc::new(Tsdb::open(config).unwrap());

        db.write(Point::new(cpu(), 1, 1.0)).unwrap();
        db.flush().unwrap();
        db.write(Point::new(cpu(), 2, 2.0)).unwrap();
        db.flush().unwrap();
        assert_eq!(db.stats().segment_count, 2);

        let maintenance = db.spawn_maintenance();

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while db.stats().segment_count != 1 && std::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(db.stats().segment_count, 1, "maintenance loop never compacted");

        maintenance.stop().await;

        let points = db.query(&cpu(), TimeRange::all()).unwrap();
        assert_eq!(points, vec![(1, 1.0), (2, 2.0)]);
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

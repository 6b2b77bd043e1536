//! In-memory write buffer
//!
//! Recent writes land here after the WAL accepts them. The buffer is a
//! lock-free skip map ordered by (series, timestamp), so point lookups,
//! range scans, and the sorted iteration a flush needs all come from the
//! same structure. A write to an occupied (series, timestamp) slot wins
//! only if it carries a higher sequence number.

use crate::{Point, SequenceNumber, SeriesKey, TimeRange, Timestamp};
use crossbeam_skiplist::SkipMap;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Key ordering points within the buffer: series first, then time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferKey {
    pub series: SeriesKey,
    pub timestamp: Timestamp,
}

/// Value slot for one (series, timestamp); the sequence number breaks
/// ties between duplicate writes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferValue {
    pub value: f64,
    pub seq: SequenceNumber,
}

/// Sorted in-memory buffer of unflushed points.
pub struct Buffer {
    map: SkipMap<BufferKey, BufferValue>,
    size_bytes: AtomicUsize,
    max_seq: AtomicU64,
}

impl Buffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            size_bytes: AtomicUsize::new(0),
            max_seq: AtomicU64::new(0),
        }
    }

    /// Insert a single point with its WAL-assigned sequence number.
    /// Last write wins: an existing entry is only replaced by a higher
    /// sequence number.
    pub fn insert(&self, point: Point, seq: SequenceNumber) {
        let size = point.size();
        let key = BufferKey {
            series: point.series,
            timestamp: point.timestamp,
        };
        let value = BufferValue {
            value: point.value,
            seq,
        };

        self.map
            .compare_insert(key, value, |existing| existing.seq < seq);

        // Approximate: replaced entries are counted again, which only
        // makes flushes slightly more eager.
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        self.max_seq.fetch_max(seq, Ordering::Relaxed);
    }

    /// Insert a batch whose points took consecutive sequence numbers
    /// starting at `first_seq`.
    pub fn insert_batch(&self, points: &[Point], first_seq: SequenceNumber) {
        for (i, point) in points.iter().enumerate() {
            self.insert(point.clone(), first_seq + i as u64);
        }
    }

    /// Query one series over an inclusive time range, sorted by timestamp.
    pub fn query(
        &self,
        series: &SeriesKey,
        range: TimeRange,
    ) -> Vec<(Timestamp, f64, SequenceNumber)> {
        let start = BufferKey {
            series: series.clone(),
            timestamp: range.start,
        };
        let end = BufferKey {
            series: series.clone(),
            timestamp: range.end,
        };

        self.map
            .range((Bound::Included(start), Bound::Included(end)))
            .map(|entry| {
                let v = entry.value();
                (entry.key().timestamp, v.value, v.seq)
            })
            .collect()
    }

    /// Snapshot the entire buffer grouped by series, each series sorted
    /// by timestamp. This is what a flush writes into a segment.
    pub fn snapshot(&self) -> BTreeMap<SeriesKey, Vec<(Timestamp, f64, SequenceNumber)>> {
        let mut grouped: BTreeMap<SeriesKey, Vec<(Timestamp, f64, SequenceNumber)>> =
            BTreeMap::new();
        for entry in self.map.iter() {
            let v = entry.value();
            grouped
                .entry(entry.key().series.clone())
                .or_default()
                .push((entry.key().timestamp, v.value, v.seq));
        }
        grouped
    }

    /// Distinct series currently buffered
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = Vec::new();
        for entry in self.map.iter() {
            if keys.last() != Some(&entry.key().series) {
                keys.push(entry.key().series.clone());
            }
        }
        keys
    }

    /// Min and max timestamps across all buffered points
    pub fn time_range(&self) -> Option<TimeRange> {
        let mut min = i64::MAX;
        let mut max = i64::MIN;
        for entry in self.map.iter() {
            min = min.min(entry.key().timestamp);
            max = max.max(entry.key().timestamp);
        }
        (min <= max).then(|| TimeRange::new(min, max))
    }

    /// Number of distinct (series, timestamp) slots
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if no points are buffered
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Approximate memory footprint in bytes
    pub fn size_bytes(&self) -> usize {
        self.size_bytes.load(Ordering::Relaxed)
    }

    /// Highest sequence number inserted so far
    pub fn max_seq(&self) -> SequenceNumber {
        self.max_seq.load(Ordering::Relaxed)
    }

    /// Whether the buffer has grown past the flush threshold
    pub fn should_flush(&self, limit_bytes: usize) -> bool {
        self.size_bytes() >= limit_bytes
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu(host: &str) -> SeriesKey {
        SeriesKey::new("cpu").with_tag("host", host)
    }

    #[test]
    fn test_insert_and_query_sorted() {
        let buffer = Buffer::new();
        let key = cpu("a");

        // Out of order inserts
        for (i, ts) in [30, 10, 20].iter().enumerate() {
            buffer.insert(Point::new(key.clone(), *ts, *ts as f64), i as u64);
        }

        let results = buffer.query(&key, TimeRange::all());
        let timestamps: Vec<Timestamp> = results.iter().map(|(ts, _, _)| *ts).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[test]
    fn test_last_write_wins() {
        let buffer = Buffer::new();
        let key = cpu("a");

        buffer.insert(Point::new(key.clone(), 100, 1.0), 5);
        buffer.insert(Point::new(key.clone(), 100, 2.0), 9);
        // Stale sequence must not clobber the newer value
        buffer.insert(Point::new(key.clone(), 100, 3.0), 7);

        let results = buffer.query(&key, TimeRange::all());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0], (100, 2.0, 9));
    }

    #[test]
    fn test_query_respects_series_boundaries() {
        let buffer = Buffer::new();
        buffer.insert(Point::new(cpu("a"), 100, 1.0), 0);
        buffer.insert(Point::new(cpu("b"), 100, 2.0), 1);

        let results = buffer.query(&cpu("a"), TimeRange::all());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1, 1.0);
    }

    #[test]
    fn test_query_time_range_inclusive() {
        let buffer = Buffer::new();
        let key = cpu("a");
        for ts in 1..=5 {
            buffer.insert(Point::new(key.clone(), ts, ts as f64), ts as u64);
        }

        let results = buffer.query(&key, TimeRange::new(2, 4));
        let timestamps: Vec<Timestamp> = results.iter().map(|(ts, _, _)| *ts).collect();
        assert_eq!(timestamps, vec![2, 3, 4]);
    }

    #[test]
    fn test_snapshot_groups_by_series() {
        let buffer = Buffer::new();
        buffer.insert(Point::new(cpu("a"), 20, 2.0), 0);
        buffer.insert(Point::new(cpu("a"), 10, 1.0), 1);
        buffer.insert(Point::new(cpu("b"), 5, 3.0), 2);

        let snapshot = buffer.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&cpu("a")], vec![(10, 1.0, 1), (20, 2.0, 0)]);
        assert_eq!(snapshot[&cpu("b")], vec![(5, 3.0, 2)]);
    }

    #[test]
    fn test_flush_threshold() {
        let buffer = Buffer::new();
        assert!(!buffer.should_flush(1024));

        let key = cpu("a");
        for ts in 0..100 {
            buffer.insert(Point::new(key.clone(), ts, 0.0), ts as u64);
        }
        assert!(buffer.should_flush(1024));
        assert_eq!(buffer.max_seq(), 99);
    }
}

//! Core types for tsdb

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in nanoseconds since Unix epoch
pub type Timestamp = i64;

/// Sequence number assigned by the WAL; globally monotonic across series
pub type SequenceNumber = u64;

/// Series key combining measurement and tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Measurement name (e.g., "cpu_usage", "temperature")
    pub measurement: String,
    /// Sorted tags for consistent ordering
    pub tags: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a new series key
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag to the series key
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.measurement.len()
            + self
                .tags
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Canonical string representation: `measurement,tag=value,...`
    pub fn canonical(&self) -> String {
        let mut s = self.measurement.clone();
        for (k, v) in &self.tags {
            s.push(',');
            s.push_str(k);
            s.push('=');
            s.push_str(v);
        }
        s
    }

    /// Parse a series key back from its canonical form
    pub fn from_canonical(canonical: &str) -> Self {
        let mut parts = canonical.splitn(2, ',');
        let mut key = SeriesKey::new(parts.next().unwrap_or(""));
        if let Some(tags) = parts.next() {
            for pair in tags.split(',') {
                if let Some((k, v)) = pair.split_once('=') {
                    key = key.with_tag(k, v);
                }
            }
        }
        key
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// A single data point: one value for one series at one instant.
/// Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Series this point belongs to
    pub series: SeriesKey,
    /// Timestamp in nanoseconds
    pub timestamp: Timestamp,
    /// Measured value
    pub value: f64,
}

impl Point {
    /// Create a new point
    pub fn new(series: SeriesKey, timestamp: Timestamp, value: f64) -> Self {
        Self {
            series,
            timestamp,
            value,
        }
    }

    /// Get the size in bytes (approximate)
    pub fn size(&self) -> usize {
        self.series.size() + 16 // timestamp + value
    }
}

/// Time range for queries, inclusive on both ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (inclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Range covering all representable timestamps
    pub fn all() -> Self {
        Self::new(i64::MIN, i64::MAX)
    }

    /// Check if a timestamp is within the range
    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts <= self.end
    }

    /// Check if two ranges overlap
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Duration in nanoseconds
    pub fn duration(&self) -> i64 {
        self.end - self.start
    }
}

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    First,
    Last,
    Stddev,
}

impl Aggregate {
    /// Parse from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "count" => Some(Aggregate::Count),
            "sum" => Some(Aggregate::Sum),
            "mean" | "avg" | "average" => Some(Aggregate::Mean),
            "min" => Some(Aggregate::Min),
            "max" => Some(Aggregate::Max),
            "first" => Some(Aggregate::First),
            "last" => Some(Aggregate::Last),
            "stddev" => Some(Aggregate::Stddev),
            _ => None,
        }
    }
}

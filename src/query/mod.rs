//! Query engine
//!
//! Queries read the buffer and every overlapping segment, merge the
//! results into one timestamp-ordered run, and resolve duplicate
//! (series, timestamp) slots by sequence number: the latest accepted
//! write wins regardless of which source it came from.

mod aggregates;

pub use aggregates::{accumulator, Accumulator};

use crate::{Aggregate, SequenceNumber, Timestamp};

/// Merge points gathered from the buffer and any number of segments.
///
/// Input runs need not be sorted relative to each other. Output is
/// sorted by timestamp with exactly one value per timestamp.
pub fn merge_points(
    sources: Vec<Vec<(Timestamp, f64, SequenceNumber)>>,
) -> Vec<(Timestamp, f64)> {
    let mut all: Vec<(Timestamp, f64, SequenceNumber)> =
        sources.into_iter().flatten().collect();
    all.sort_unstable_by_key(|(ts, _, seq)| (*ts, *seq));

    let mut merged: Vec<(Timestamp, f64)> = Vec::with_capacity(all.len());
    for (ts, value, _) in all {
        match merged.last_mut() {
            // Ascending seq within a timestamp, so later entries win
            Some(last) if last.0 == ts => last.1 = value,
            _ => merged.push((ts, value)),
        }
    }
    merged
}

/// Aggregate an entire sorted run down to a single value.
pub fn aggregate(points: &[(Timestamp, f64)], agg: Aggregate) -> Option<f64> {
    let mut acc = accumulator(agg);
    for (ts, value) in points {
        acc.update(*ts, *value);
    }
    acc.result()
}

/// Aggregate a sorted run into fixed-width windows.
///
/// Windows are aligned to `start`: window `i` covers
/// `[start + i*width, start + (i+1)*width)`. Windows with no points are
/// omitted. Each output pair is (window start, aggregate value).
pub fn window_aggregate(
    points: &[(Timestamp, f64)],
    start: Timestamp,
    width: i64,
    agg: Aggregate,
) -> Vec<(Timestamp, f64)> {
    debug_assert!(width > 0);

    // i128 keeps unbounded ranges (start near i64::MIN) from overflowing;
    // a window's start is between `start` and its last point, so the cast
    // back always fits
    let window_of = |ts: Timestamp| (ts as i128 - start as i128).div_euclid(width as i128);
    let start_of = |w: i128| (start as i128 + w * width as i128) as Timestamp;

    let mut results = Vec::new();
    let mut current_window: Option<i128> = None;
    let mut acc = accumulator(agg);

    for (ts, value) in points {
        let window = window_of(*ts);
        if current_window != Some(window) {
            if let Some(w) = current_window {
                if let Some(v) = acc.result() {
                    results.push((start_of(w), v));
                }
            }
            acc = accumulator(agg);
            current_window = Some(window);
        }
        acc.update(*ts, *value);
    }

    if let Some(w) = current_window {
        if let Some(v) = acc.result() {
            results.push((start_of(w), v));
        }
    }

    results
}

//! Aggregate function implementations

use crate::{Aggregate, Timestamp};

/// Incremental accumulator over one window of points.
///
/// Points arrive in ascending timestamp order, which First and Last
/// rely on.
pub trait Accumulator: Send {
    /// Fold in one point
    fn update(&mut self, timestamp: Timestamp, value: f64);

    /// Current result, `None` if undefined for the points seen so far
    fn result(&self) -> Option<f64>;
}

/// Build a fresh accumulator for an aggregate function
pub fn accumulator(agg: Aggregate) -> Box<dyn Accumulator> {
    match agg {
        Aggregate::Count => Box::new(Count::default()),
        Aggregate::Sum => Box::new(Sum::default()),
        Aggregate::Mean => Box::new(Mean::default()),
        Aggregate::Min => Box::new(Min::default()),
        Aggregate::Max => Box::new(Max::default()),
        Aggregate::First => Box::new(First::default()),
        Aggregate::Last => Box::new(Last::default()),
        Aggregate::Stddev => Box::new(Stddev::default()),
    }
}

#[derive(Debug, Default)]
struct Count {
    count: u64,
}

impl Accumulator for Count {
    fn update(&mut self, _ts: Timestamp, _value: f64) {
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        Some(self.count as f64)
    }
}

#[derive(Debug, Default)]
struct Sum {
    sum: f64,
    count: u64,
}

impl Accumulator for Sum {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then_some(self.sum)
    }
}

#[derive(Debug, Default)]
struct Mean {
    sum: f64,
    count: u64,
}

impl Accumulator for Mean {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn result(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Default)]
struct Min {
    min: Option<f64>,
}

impl Accumulator for Min {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.min = Some(match self.min {
            Some(current) => current.min(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.min
    }
}

#[derive(Debug, Default)]
struct Max {
    max: Option<f64>,
}

impl Accumulator for Max {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.max = Some(match self.max {
            Some(current) => current.max(value),
            None => value,
        });
    }

    fn result(&self) -> Option<f64> {
        self.max
    }
}

#[derive(Debug, Default)]
struct First {
    value: Option<f64>,
}

impl Accumulator for First {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        if self.value.is_none() {
            self.value = Some(value);
        }
    }

    fn result(&self) -> Option<f64> {
        self.value
    }
}

#[derive(Debug, Default)]
struct Last {
    value: Option<f64>,
}

impl Accumulator for Last {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.value = Some(value);
    }

    fn result(&self) -> Option<f64> {
        self.value
    }
}

/// Welford's online variance
#[derive(Debug, Default)]
struct Stddev {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Accumulator for Stddev {
    fn update(&mut self, _ts: Timestamp, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn result(&self) -> Option<f64> {
        (self.count > 1).then(|| (self.m2 / self.count as f64).sqrt())
    }
}

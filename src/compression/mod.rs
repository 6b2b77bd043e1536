//! Time-series compression
//!
//! Timestamps are delta-of-delta encoded and values XOR encoded, the
//! scheme from the Gorilla paper. Regular scrape intervals and slowly
//! moving values both collapse to a bit or two per point.

mod bits;
mod gorilla;

pub use bits::{BitReader, BitWriter};
pub use gorilla::{GorillaDecoder, GorillaEncoder};

/// A compressed run of (timestamp, value) pairs for a single series.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    /// Encoded bitstream
    pub data: Vec<u8>,
    /// Number of points encoded
    pub count: usize,
    /// Earliest timestamp in the block
    pub min_timestamp: i64,
    /// Latest timestamp in the block
    pub max_timestamp: i64,
}

impl CompressedBlock {
    /// Average encoded size per point
    pub fn bytes_per_point(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.data.len() as f64 / self.count as f64
    }
}

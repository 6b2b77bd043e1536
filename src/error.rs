//! Error types for tsdb

use thiserror::Error;

/// Result type alias for tsdb operations
pub type Result<T> = std::result::Result<T, TsdbError>;

/// tsdb error types
#[derive(Error, Debug)]
pub enum TsdbError {
    /// IO operation failed; the write must not be acknowledged
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Segment failed checksum or structural validation on read
    #[error("Corrupt segment: {0}")]
    CorruptSegment(String),

    /// Checksum mismatch in a WAL entry or segment block
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),

    /// WAL recovery error
    #[error("WAL recovery error: {0}")]
    WalRecovery(String),

    /// Compaction error
    #[error("Compaction error: {0}")]
    Compaction(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TsdbError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TsdbError::Io(_) | TsdbError::Compaction(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TsdbError::CorruptSegment(_) | TsdbError::ChecksumMismatch { .. }
        )
    }
}

//! WAL entry framing and serialization

use crate::{Point, Result, SequenceNumber, TsdbError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// WAL entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WalEntryKind {
    /// Write data points
    Write = 1,
    /// Flush checkpoint: all points with sequence <= payload are in segments
    Checkpoint = 2,
}

impl TryFrom<u8> for WalEntryKind {
    type Error = TsdbError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalEntryKind::Write),
            2 => Ok(WalEntryKind::Checkpoint),
            _ => Err(TsdbError::InvalidFormat(format!(
                "Invalid WAL entry kind: {}",
                value
            ))),
        }
    }
}

/// A single WAL entry
#[derive(Debug, Clone)]
pub struct WalEntry {
    /// Entry kind
    pub kind: WalEntryKind,
    /// Sequence number of the first point in this entry; for a checkpoint,
    /// the highest sequence number covered by the flush
    pub first_seq: SequenceNumber,
    /// Entry payload (bincode-serialized points, empty for checkpoints)
    pub payload: Vec<u8>,
}

impl WalEntry {
    /// Create a write entry for a batch of points
    pub fn write(first_seq: SequenceNumber, points: &[Point]) -> Result<Self> {
        let payload =
            bincode::serialize(points).map_err(|e| TsdbError::InvalidFormat(e.to_string()))?;
        Ok(Self {
            kind: WalEntryKind::Write,
            first_seq,
            payload,
        })
    }

    /// Create a checkpoint entry covering all sequences up to `seq`
    pub fn checkpoint(seq: SequenceNumber) -> Self {
        Self {
            kind: WalEntryKind::Checkpoint,
            first_seq: seq,
            payload: vec![],
        }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - 1 byte: entry kind
    /// - 8 bytes: first sequence number
    /// - 4 bytes: payload length
    /// - N bytes: payload
    /// - 4 bytes: CRC32 checksum
    pub fn serialize_with_checksum(&self) -> Bytes {
        let mut buf = BytesMut::new();

        // Reserve space for length prefix
        buf.put_u32_le(0);

        buf.put_u8(self.kind as u8);
        buf.put_u64_le(self.first_seq);

        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        // Checksum covers everything after the length prefix
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        let len = (buf.len() - 4) as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());

        buf.freeze()
    }

    /// Deserialize entry from bytes, validating checksum.
    /// Returns the entry and the total number of bytes consumed.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 4 {
            return Err(TsdbError::InvalidFormat("Entry too short".into()));
        }

        let mut cursor = std::io::Cursor::new(data);
        let len = cursor.get_u32_le() as usize;
        if data.len() < 4 + len {
            return Err(TsdbError::InvalidFormat("Incomplete entry".into()));
        }

        let entry_data = &data[4..4 + len];
        if entry_data.len() < 17 {
            return Err(TsdbError::InvalidFormat("Entry body too short".into()));
        }

        let expected_checksum = {
            let mut c = std::io::Cursor::new(&entry_data[entry_data.len() - 4..]);
            c.get_u32_le()
        };
        let actual_checksum = crc32fast::hash(&entry_data[..entry_data.len() - 4]);

        if expected_checksum != actual_checksum {
            return Err(TsdbError::ChecksumMismatch {
                expected: expected_checksum,
                actual: actual_checksum,
            });
        }

        let mut cursor = std::io::Cursor::new(entry_data);
        let kind = WalEntryKind::try_from(cursor.get_u8())?;
        let first_seq = cursor.get_u64_le();

        let payload_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + payload_len + 4 > entry_data.len() {
            return Err(TsdbError::InvalidFormat("Payload length out of bounds".into()));
        }
        let payload = entry_data[pos..pos + payload_len].to_vec();

        let entry = WalEntry {
            kind,
            first_seq,
            payload,
        };

        Ok((entry, 4 + len))
    }

    /// Get the points from a write entry
    pub fn points(&self) -> Result<Vec<Point>> {
        if self.kind != WalEntryKind::Write {
            return Err(TsdbError::InvalidFormat("Not a write entry".into()));
        }
        bincode::deserialize(&self.payload).map_err(|e| TsdbError::InvalidFormat(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SeriesKey;

    #[test]
    fn test_entry_serialization() {
        let key = SeriesKey::new("cpu_usage").with_tag("host", "server1");
        let points = vec![Point::new(key, 1_000_000, 23.5)];

        let entry = WalEntry::write(42, &points).unwrap();
        let serialized = entry.serialize_with_checksum();

        let (deserialized, len) = WalEntry::deserialize_with_checksum(&serialized).unwrap();
        assert_eq!(len, serialized.len());
        assert_eq!(deserialized.kind, WalEntryKind::Write);
        assert_eq!(deserialized.first_seq, 42);

        let recovered = deserialized.points().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].timestamp, 1_000_000);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let entry = WalEntry::checkpoint(100);
        let serialized = entry.serialize_with_checksum();

        let (deserialized, _) = WalEntry::deserialize_with_checksum(&serialized).unwrap();
        assert_eq!(deserialized.kind, WalEntryKind::Checkpoint);
        assert_eq!(deserialized.first_seq, 100);
        assert!(deserialized.payload.is_empty());
    }

    #[test]
    fn test_checksum_validation() {
        let entry = WalEntry::checkpoint(7);
        let mut serialized = entry.serialize_with_checksum().to_vec();

        // Corrupt the body
        serialized[6] ^= 0xFF;

        let result = WalEntry::deserialize_with_checksum(&serialized);
        assert!(matches!(result, Err(TsdbError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_truncated_entry() {
        let key = SeriesKey::new("temp");
        let points = vec![Point::new(key, 1, 1.0)];
        let entry = WalEntry::write(0, &points).unwrap();
        let serialized = entry.serialize_with_checksum();

        let result = WalEntry::deserialize_with_checksum(&serialized[..serialized.len() - 3]);
        assert!(matches!(result, Err(TsdbError::InvalidFormat(_))));
    }
}

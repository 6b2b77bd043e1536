//! Per-series data block within a segment

use crate::compression::{GorillaDecoder, GorillaEncoder};
use crate::{Result, SequenceNumber, SeriesKey, Timestamp, TsdbError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// One series' compressed points inside a segment.
///
/// Carries the highest sequence number of its points so readers can
/// resolve duplicate (series, timestamp) slots across segments: a block
/// written later always has a higher `max_seq`.
#[derive(Debug, Clone)]
pub struct SeriesBlock {
    /// Series this block belongs to
    pub series: SeriesKey,
    /// Gorilla-encoded bitstream
    pub data: Vec<u8>,
    /// Number of points
    pub count: usize,
    /// Earliest timestamp
    pub min_timestamp: Timestamp,
    /// Latest timestamp
    pub max_timestamp: Timestamp,
    /// Highest sequence number of any point in the block
    pub max_seq: SequenceNumber,
}

impl SeriesBlock {
    /// Compress a series' points, which must be sorted by timestamp.
    pub fn build(series: SeriesKey, points: &[(Timestamp, f64, SequenceNumber)]) -> Self {
        let mut encoder = GorillaEncoder::new();
        let mut max_seq = 0;
        for (ts, value, seq) in points {
            encoder.push(*ts, *value);
            max_seq = max_seq.max(*seq);
        }
        let block = encoder.finish();

        Self {
            series,
            data: block.data,
            count: block.count,
            min_timestamp: block.min_timestamp,
            max_timestamp: block.max_timestamp,
            max_seq,
        }
    }

    /// Decode every point in the block
    pub fn decode(&self) -> Result<Vec<(Timestamp, f64)>> {
        GorillaDecoder::new(&self.data, self.count).decode_all()
    }

    /// Serialize with optional LZ4 over the bitstream and a trailing CRC.
    ///
    /// Layout:
    /// - 2 bytes: series key length, then the canonical key
    /// - 4 bytes: point count
    /// - 8 bytes: min timestamp
    /// - 8 bytes: max timestamp
    /// - 8 bytes: max sequence number
    /// - 1 byte: LZ4 flag
    /// - 4 bytes: data length, then the data
    /// - 4 bytes: CRC32 over everything above
    pub fn to_bytes(&self, use_lz4: bool) -> Bytes {
        let mut buf = BytesMut::new();

        let key = self.series.canonical();
        buf.put_u16_le(key.len() as u16);
        buf.put_slice(key.as_bytes());

        buf.put_u32_le(self.count as u32);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u64_le(self.max_seq);

        if use_lz4 {
            let compressed = lz4_flex::compress_prepend_size(&self.data);
            buf.put_u8(1);
            buf.put_u32_le(compressed.len() as u32);
            buf.put_slice(&compressed);
        } else {
            buf.put_u8(0);
            buf.put_u32_le(self.data.len() as u32);
            buf.put_slice(&self.data);
        }

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserialize, validating the CRC before trusting anything else.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 39 {
            return Err(TsdbError::InvalidFormat("Series block too short".into()));
        }

        let body_len = data.len() - 4;
        let expected = {
            let mut c = std::io::Cursor::new(&data[body_len..]);
            c.get_u32_le()
        };
        let actual = crc32fast::hash(&data[..body_len]);
        if expected != actual {
            return Err(TsdbError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = std::io::Cursor::new(data);

        let key_len = cursor.get_u16_le() as usize;
        let pos = cursor.position() as usize;
        if pos + key_len > body_len {
            return Err(TsdbError::InvalidFormat("Series key out of bounds".into()));
        }
        let key = std::str::from_utf8(&data[pos..pos + key_len])
            .map_err(|e| TsdbError::InvalidFormat(e.to_string()))?;
        let series = SeriesKey::from_canonical(key);
        cursor.set_position((pos + key_len) as u64);

        let count = cursor.get_u32_le() as usize;
        let min_timestamp = cursor.get_i64_le();
        let max_timestamp = cursor.get_i64_le();
        let max_seq = cursor.get_u64_le();

        let lz4_flag = cursor.get_u8();
        let data_len = cursor.get_u32_le() as usize;
        let pos = cursor.position() as usize;
        if pos + data_len > body_len {
            return Err(TsdbError::InvalidFormat("Block data out of bounds".into()));
        }
        let raw = &data[pos..pos + data_len];

        let block_data = if lz4_flag == 1 {
            lz4_flex::decompress_size_prepended(raw)
                .map_err(|e| TsdbError::Compression(e.to_string()))?
        } else {
            raw.to_vec()
        };

        Ok(Self {
            series,
            data: block_data,
            count,
            min_timestamp,
            max_timestamp,
            max_seq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block() -> SeriesBlock {
        let series = SeriesKey::new("cpu").with_tag("host", "a");
        let points: Vec<(Timestamp, f64, SequenceNumber)> = (0..50)
            .map(|i| (i * 1_000_000_000, i as f64 * 0.5, 100 + i as u64))
            .collect();
        SeriesBlock::build(series, &points)
    }

    #[test]
    fn test_build_and_decode() {
        let block = sample_block();
        assert_eq!(block.count, 50);
        assert_eq!(block.min_timestamp, 0);
        assert_eq!(block.max_timestamp, 49 * 1_000_000_000);
        assert_eq!(block.max_seq, 149);

        let points = block.decode().unwrap();
        assert_eq!(points.len(), 50);
        assert_eq!(points[10], (10_000_000_000, 5.0));
    }

    #[test]
    fn test_serialization_with_lz4() {
        let block = sample_block();
        let bytes = block.to_bytes(true);

        let restored = SeriesBlock::from_bytes(&bytes).unwrap();
        assert_eq!(restored.series, block.series);
        assert_eq!(restored.count, 50);
        assert_eq!(restored.max_seq, 149);
        assert_eq!(restored.decode().unwrap(), block.decode().unwrap());
    }

    #[test]
    fn test_corruption_detected() {
        let block = sample_block();
        let mut bytes = block.to_bytes(false).to_vec();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;

        assert!(matches!(
            SeriesBlock::from_bytes(&bytes),
            Err(TsdbError::ChecksumMismatch { .. })
        ));
    }
}

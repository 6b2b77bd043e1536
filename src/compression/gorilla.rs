//! Gorilla delta-of-delta / XOR codec

use super::bits::{BitReader, BitWriter};
use super::CompressedBlock;
use crate::{Result, TsdbError};

/// Streaming encoder for one series' (timestamp, value) pairs.
///
/// Points must arrive in ascending timestamp order; the segment builder
/// guarantees that.
pub struct GorillaEncoder {
    writer: BitWriter,
    count: usize,
    min_timestamp: i64,
    prev_timestamp: i64,
    prev_delta: i64,
    prev_bits: u64,
    window_leading: u32,
    window_trailing: u32,
}

impl GorillaEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(4096),
            count: 0,
            min_timestamp: 0,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_bits: 0,
            window_leading: 0,
            window_trailing: 0,
        }
    }

    /// Append one point to the stream
    pub fn push(&mut self, timestamp: i64, value: f64) {
        if self.count == 0 {
            // Header point is stored verbatim
            self.min_timestamp = timestamp;
            self.prev_timestamp = timestamp;
            self.prev_bits = value.to_bits();
            self.writer.write_bits(timestamp as u64, 64);
            self.writer.write_bits(self.prev_bits, 64);
        } else {
            self.push_timestamp(timestamp);
            self.push_value(value);
        }
        self.count += 1;
    }

    /// Seal the stream into a block
    pub fn finish(self) -> CompressedBlock {
        CompressedBlock {
            data: self.writer.finish(),
            count: self.count,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.prev_timestamp,
        }
    }

    /// Number of points pushed so far
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn push_timestamp(&mut self, timestamp: i64) {
        let delta = timestamp - self.prev_timestamp;
        let dod = delta - self.prev_delta;
        self.prev_delta = delta;
        self.prev_timestamp = timestamp;

        // Bucketed by magnitude: a steady scrape interval costs one bit
        match dod {
            0 => self.writer.write_bit(false),
            -63..=64 => {
                self.writer.write_bits(0b10, 2);
                self.writer.write_bits((dod + 63) as u64, 7);
            }
            -255..=256 => {
                self.writer.write_bits(0b110, 3);
                self.writer.write_bits((dod + 255) as u64, 9);
            }
            -2047..=2048 => {
                self.writer.write_bits(0b1110, 4);
                self.writer.write_bits((dod + 2047) as u64, 12);
            }
            _ => {
                self.writer.write_bits(0b1111, 4);
                self.writer.write_bits(dod as u64, 64);
            }
        }
    }

    fn push_value(&mut self, value: f64) {
        let bits = value.to_bits();
        let xor = bits ^ self.prev_bits;
        self.prev_bits = bits;

        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        let leading = xor.leading_zeros();
        let trailing = xor.trailing_zeros();

        if leading >= self.window_leading && trailing >= self.window_trailing {
            // Meaningful bits fit inside the previous window
            self.writer.write_bit(false);
            let width = 64 - self.window_leading - self.window_trailing;
            self.writer.write_bits(xor >> self.window_trailing, width);
        } else {
            self.writer.write_bit(true);
            // 5 bits of leading zeros caps at 31
            let leading = leading.min(31);
            let width = 64 - leading - trailing;
            self.writer.write_bits(leading as u64, 5);
            self.writer.write_bits(width as u64, 6);
            self.writer.write_bits(xor >> trailing, width);
            self.window_leading = leading;
            self.window_trailing = trailing;
        }
    }
}

impl Default for GorillaEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for a block produced by [`GorillaEncoder`].
pub struct GorillaDecoder<'a> {
    reader: BitReader<'a>,
    remaining: usize,
    started: bool,
    prev_timestamp: i64,
    prev_delta: i64,
    prev_bits: u64,
    window_leading: u32,
    window_trailing: u32,
}

impl<'a> GorillaDecoder<'a> {
    /// Decode `count` points from `data`
    pub fn new(data: &'a [u8], count: usize) -> Self {
        Self {
            reader: BitReader::new(data),
            remaining: count,
            started: false,
            prev_timestamp: 0,
            prev_delta: 0,
            prev_bits: 0,
            window_leading: 0,
            window_trailing: 0,
        }
    }

    /// Decode every remaining point
    pub fn decode_all(mut self) -> Result<Vec<(i64, f64)>> {
        let mut points = Vec::with_capacity(self.remaining);
        while let Some(pair) = self.next_point()? {
            points.push(pair);
        }
        Ok(points)
    }

    fn next_point(&mut self) -> Result<Option<(i64, f64)>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;

        if !self.started {
            self.started = true;
            self.prev_timestamp = self.take(64)? as i64;
            self.prev_bits = self.take(64)?;
            return Ok(Some((self.prev_timestamp, f64::from_bits(self.prev_bits))));
        }

        let timestamp = self.next_timestamp()?;
        let value = self.next_value()?;
        Ok(Some((timestamp, value)))
    }

    fn next_timestamp(&mut self) -> Result<i64> {
        // Unary prefix selects the delta-of-delta bucket
        let mut prefix = 0u32;
        while prefix < 4 && self.take_bit()? {
            prefix += 1;
        }

        let dod = match prefix {
            0 => 0,
            1 => self.take(7)? as i64 - 63,
            2 => self.take(9)? as i64 - 255,
            3 => self.take(12)? as i64 - 2047,
            _ => self.take(64)? as i64,
        };

        self.prev_delta += dod;
        self.prev_timestamp += self.prev_delta;
        Ok(self.prev_timestamp)
    }

    fn next_value(&mut self) -> Result<f64> {
        if !self.take_bit()? {
            return Ok(f64::from_bits(self.prev_bits));
        }

        if self.take_bit()? {
            let leading = self.take(5)? as u32;
            // Width 64 wraps to 0 in the 6-bit field
            let width = match self.take(6)? as u32 {
                0 => 64,
                w => w,
            };
            if leading + width > 64 {
                return Err(TsdbError::Compression(
                    "xor window exceeds 64 bits".into(),
                ));
            }
            self.window_leading = leading;
            self.window_trailing = 64 - leading - width;
        }

        let width = 64 - self.window_leading - self.window_trailing;
        let xor = self.take(width)? << self.window_trailing;
        self.prev_bits ^= xor;
        Ok(f64::from_bits(self.prev_bits))
    }

    fn take(&mut self, bits: u32) -> Result<u64> {
        self.reader
            .read_bits(bits)
            .ok_or_else(|| TsdbError::Compression("unexpected end of block".into()))
    }

    fn take_bit(&mut self) -> Result<bool> {
        self.reader
            .read_bit()
            .ok_or_else(|| TsdbError::Compression("unexpected end of block".into()))
    }
}

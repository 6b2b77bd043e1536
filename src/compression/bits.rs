//! MSB-first bit-level I/O

/// Appends bits to a growing byte buffer, most significant bit first.
#[derive(Debug, Default)]
pub struct BitWriter {
    out: Vec<u8>,
    cur: u8,
    used: u32,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            out: Vec::with_capacity(capacity),
            cur: 0,
            used: 0,
        }
    }

    /// Append a single bit
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Append the low `bits` bits of `value`, a byte-sized chunk at a time
    #[inline]
    pub fn write_bits(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 64);
        let mut remaining = bits;
        while remaining > 0 {
            let take = (8 - self.used).min(remaining);
            remaining -= take;
            let chunk = ((value >> remaining) & ((1u64 << take) - 1)) as u8;
            // A full-byte chunk on an aligned writer would shift cur by 8
            self.cur = if take == 8 {
                chunk
            } else {
                (self.cur << take) | chunk
            };
            self.used += take;
            if self.used == 8 {
                self.out.push(self.cur);
                self.cur = 0;
                self.used = 0;
            }
        }
    }

    /// Flush the partial byte (zero-padded) and return the buffer
    pub fn finish(mut self) -> Vec<u8> {
        if self.used > 0 {
            self.out.push(self.cur << (8 - self.used));
        }
        self.out
    }

    /// Total size in bytes once finished
    pub fn len(&self) -> usize {
        self.out.len() + (self.used > 0) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty() && self.used == 0
    }
}

/// Reads bits back out of a byte slice, most significant bit first.
#[derive(Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read a single bit
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    /// Read `bits` bits into the low end of a u64
    #[inline]
    pub fn read_bits(&mut self, bits: u32) -> Option<u64> {
        debug_assert!(bits <= 64);
        if self.pos + bits as usize > self.data.len() * 8 {
            return None;
        }

        let mut value = 0u64;
        let mut remaining = bits;
        while remaining > 0 {
            let byte = self.data[self.pos / 8];
            let offset = (self.pos % 8) as u32;
            let avail = 8 - offset;
            let take = avail.min(remaining);
            let chunk = (byte >> (avail - take)) & ((1u16 << take) - 1) as u8;
            value = (value << take) | chunk as u64;
            self.pos += take as usize;
            remaining -= take;
        }
        Some(value)
    }

    /// Bit offset from the start of the slice
    pub fn position(&self) -> usize {
        self.pos
    }
}

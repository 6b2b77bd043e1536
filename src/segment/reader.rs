//! Segment reader

use super::{parse_segment_id, SegmentMeta, SeriesBlock, FORMAT_VERSION, MAGIC};
use crate::{Result, SequenceNumber, SeriesKey, TimeRange, Timestamp, TsdbError};
use bytes::Buf;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

/// Fixed header size: magic, version, level, point count, time range, max seq
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8 + 8;

/// Fixed footer size: index offset, index size, magic
const FOOTER_SIZE: usize = 8 + 8 + 4;

/// Read handle for one immutable segment file.
///
/// The index is held in memory; block reads hit a small decoded-block
/// cache before touching the file.
pub struct SegmentReader {
    path: PathBuf,
    // The handle from open() outlives unlink: compaction and retention
    // delete retired files while queries may still hold this reader
    file: Mutex<File>,
    meta: SegmentMeta,
    index: Vec<IndexEntry>,
    cache: RwLock<BlockCache>,
}

#[derive(Debug, Clone)]
struct IndexEntry {
    key: String,
    offset: u64,
    size: u32,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    max_seq: SequenceNumber,
}

struct BlockCache {
    blocks: BTreeMap<u64, Arc<SeriesBlock>>,
    bytes: usize,
    max_bytes: usize,
}

impl BlockCache {
    fn new(max_bytes: usize) -> Self {
        Self {
            blocks: BTreeMap::new(),
            bytes: 0,
            max_bytes,
        }
    }

    fn get(&self, offset: u64) -> Option<Arc<SeriesBlock>> {
        self.blocks.get(&offset).cloned()
    }

    fn insert(&mut self, offset: u64, block: Arc<SeriesBlock>) {
        let size = block.data.len();
        while self.bytes + size > self.max_bytes {
            let Some((&oldest, _)) = self.blocks.iter().next() else {
                break;
            };
            if let Some(removed) = self.blocks.remove(&oldest) {
                self.bytes -= removed.data.len();
            }
        }
        self.bytes += size;
        self.blocks.insert(offset, block);
    }
}

impl SegmentReader {
    /// Open and validate a segment file.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut file = File::open(&path)?;
        let file_size = file.metadata()?.len();

        if (file_size as usize) < HEADER_SIZE + FOOTER_SIZE {
            return Err(TsdbError::CorruptSegment(format!(
                "{}: file too small ({} bytes)",
                path.display(),
                file_size
            )));
        }

        // Footer first: it locates the index
        file.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let mut footer = [0u8; FOOTER_SIZE];
        file.read_exact(&mut footer)?;

        let mut cursor = std::io::Cursor::new(&footer[..]);
        let index_offset = cursor.get_u64_le();
        let index_size = cursor.get_u64_le();
        if &footer[16..20] != MAGIC {
            return Err(TsdbError::CorruptSegment(format!(
                "{}: bad footer magic",
                path.display()
            )));
        }

        file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE];
        file.read_exact(&mut header)?;

        if &header[..4] != MAGIC {
            return Err(TsdbError::CorruptSegment(format!(
                "{}: bad header magic",
                path.display()
            )));
        }
        let mut cursor = std::io::Cursor::new(&header[4..]);
        let version = cursor.get_u32_le();
        if version != FORMAT_VERSION {
            return Err(TsdbError::CorruptSegment(format!(
                "{}: unsupported format version {}",
                path.display(),
                version
            )));
        }
        let level = cursor.get_u32_le();
        let point_count = cursor.get_u64_le() as usize;
        let min_timestamp = cursor.get_i64_le();
        let max_timestamp = cursor.get_i64_le();
        let max_seq = cursor.get_u64_le();

        // A corrupt footer can make this sum wrap, so the add is checked
        let index_end = index_offset
            .checked_add(index_size)
            .filter(|end| *end <= file_size - FOOTER_SIZE as u64);
        if index_end.is_none() {
            return Err(TsdbError::CorruptSegment(format!(
                "{}: index out of bounds",
                path.display()
            )));
        }
        file.seek(SeekFrom::Start(index_offset))?;
        let mut index_data = vec![0u8; index_size as usize];
        file.read_exact(&mut index_data)?;
        let index = Self::parse_index(&index_data)
            .map_err(|e| TsdbError::CorruptSegment(format!("{}: {}", path.display(), e)))?;

        let id = parse_segment_id(&path).unwrap_or(0);
        let meta = SegmentMeta {
            path: path.clone(),
            id,
            level,
            point_count,
            file_size,
            min_timestamp,
            max_timestamp,
            max_seq,
        };

        Ok(Self {
            path,
            file: Mutex::new(file),
            meta,
            index,
            cache: RwLock::new(BlockCache::new(8 * 1024 * 1024)),
        })
    }

    /// Segment metadata
    pub fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Whether this segment holds any block for `series`
    pub fn contains_series(&self, series: &SeriesKey) -> bool {
        let key = series.canonical();
        self.index.iter().any(|e| e.key == key)
    }

    /// Series keys present in this segment, in key order
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.index
            .iter()
            .map(|e| SeriesKey::from_canonical(&e.key))
            .collect()
    }

    /// Read one series' points inside `range`, with the sequence number
    /// each point resolves under. Flush order makes segment IDs agree
    /// with sequence order, so the block's max_seq is exact enough to
    /// rank any point here against the same slot in another source.
    pub fn read(
        &self,
        series: &SeriesKey,
        range: &TimeRange,
    ) -> Result<Vec<(Timestamp, f64, SequenceNumber)>> {
        if !self.meta.overlaps(range) {
            return Ok(vec![]);
        }

        let key = series.canonical();
        let mut results = Vec::new();
        for entry in &self.index {
            if entry.key != key {
                continue;
            }
            if entry.max_timestamp < range.start || entry.min_timestamp > range.end {
                continue;
            }

            let block = self.read_block(entry)?;
            for (ts, value) in self.decode_block(&block)? {
                if range.contains(ts) {
                    results.push((ts, value, entry.max_seq));
                }
            }
        }

        Ok(results)
    }

    /// Read the entire segment grouped by series, for compaction.
    pub fn read_all(&self) -> Result<BTreeMap<SeriesKey, Vec<(Timestamp, f64, SequenceNumber)>>> {
        let mut all = BTreeMap::new();
        for entry in &self.index {
            let block = self.read_block(entry)?;
            let points: Vec<(Timestamp, f64, SequenceNumber)> = self
                .decode_block(&block)?
                .into_iter()
                .map(|(ts, value)| (ts, value, entry.max_seq))
                .collect();
            all.entry(SeriesKey::from_canonical(&entry.key))
                .or_insert_with(Vec::new)
                .extend(points);
        }
        Ok(all)
    }

    fn decode_block(&self, block: &SeriesBlock) -> Result<Vec<(Timestamp, f64)>> {
        block
            .decode()
            .map_err(|e| TsdbError::CorruptSegment(format!("{}: {}", self.path.display(), e)))
    }

    fn read_block(&self, entry: &IndexEntry) -> Result<Arc<SeriesBlock>> {
        if let Some(block) = self.cache.read().get(entry.offset) {
            return Ok(block);
        }

        let mut data = vec![0u8; entry.size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.offset))?;
            file.read_exact(&mut data)?;
        }

        let block = Arc::new(SeriesBlock::from_bytes(&data).map_err(|e| {
            if e.is_corruption() {
                TsdbError::CorruptSegment(format!("{}: {}", self.path.display(), e))
            } else {
                e
            }
        })?);

        self.cache.write().insert(entry.offset, Arc::clone(&block));
        Ok(block)
    }

    fn parse_index(data: &[u8]) -> Result<Vec<IndexEntry>> {
        if data.len() < 4 {
            return Err(TsdbError::InvalidFormat("Index too short".into()));
        }
        let mut cursor = std::io::Cursor::new(data);
        let count = cursor.get_u32_le() as usize;
        let mut entries = Vec::with_capacity(count);

        for _ in 0..count {
            if cursor.remaining() < 2 {
                return Err(TsdbError::InvalidFormat("Truncated index entry".into()));
            }
            let key_len = cursor.get_u16_le() as usize;
            let pos = cursor.position() as usize;
            if pos + key_len + 36 > data.len() {
                return Err(TsdbError::InvalidFormat("Truncated index entry".into()));
            }
            let key = std::str::from_utf8(&data[pos..pos + key_len])
                .map_err(|e| TsdbError::InvalidFormat(e.to_string()))?
                .to_string();
            cursor.set_position((pos + key_len) as u64);

            entries.push(IndexEntry {
                key,
                offset: cursor.get_u64_le(),
                size: cursor.get_u32_le(),
                min_timestamp: cursor.get_i64_le(),
                max_timestamp: cursor.get_i64_le(),
                max_seq: cursor.get_u64_le(),
            });
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{segment_file_name, SegmentBuilder, SegmentConfig};
    use std::io::Write as _;
    use tempfile::TempDir;

    fn write_segment(dir: &std::path::Path, id: u64) -> PathBuf {
        let path = dir.join(segment_file_name(id));
        let mut builder = SegmentBuilder::new(path.clone(), id, 0, SegmentConfig::default());
        builder
            .add_series(
                SeriesKey::new("cpu").with_tag("host", "a"),
                &[(1, 0.5, 10), (2, 0.6, 11), (3, 0.7, 12)],
            )
            .unwrap();
        builder
            .add_series(SeriesKey::new("mem"), &[(2, 100.0, 13)])
            .unwrap();
        builder.finish().unwrap();
        path
    }

    #[test]
    fn test_open_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), 7);

        let reader = SegmentReader::open(path).unwrap();
        assert_eq!(reader.meta().id, 7);
        assert_eq!(reader.meta().point_count, 4);
        assert_eq!(reader.meta().max_seq, 13);

        let cpu = SeriesKey::new("cpu").with_tag("host", "a");
        let points = reader.read(&cpu, &TimeRange::new(2, 3)).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].0, 2);
        assert_eq!(points[1].1, 0.7);

        let missing = reader.read(&SeriesKey::new("disk"), &TimeRange::all()).unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn test_read_all_groups_by_series() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), 1);

        let reader = SegmentReader::open(path).unwrap();
        let all = reader.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[&SeriesKey::new("mem")], vec![(2, 100.0, 13)]);
    }

    #[test]
    fn test_read_survives_file_removal() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), 9);

        let reader = SegmentReader::open(path.clone()).unwrap();
        // Retirement by compaction or retention unlinks the file while
        // queries may still hold the reader
        std::fs::remove_file(&path).unwrap();

        let cpu = SeriesKey::new("cpu").with_tag("host", "a");
        let points = reader.read(&cpu, &TimeRange::all()).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], (1, 0.5, 12));
    }

    #[test]
    fn test_open_rejects_wrapping_footer_offsets() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), 3);

        // Rewrite the footer's index offset/size with values whose sum
        // wraps past u64::MAX, keeping the trailing magic intact
        let mut data = std::fs::read(&path).unwrap();
        let footer_start = data.len() - 20;
        data[footer_start..footer_start + 8].copy_from_slice(&u64::MAX.to_le_bytes());
        data[footer_start + 8..footer_start + 16].copy_from_slice(&8u64.to_le_bytes());
        std::fs::write(&path, &data).unwrap();

        assert!(matches!(
            SegmentReader::open(path),
            Err(TsdbError::CorruptSegment(_))
        ));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(segment_file_name(1));
        let mut file = File::create(&path).unwrap();
        file.write_all(&[0u8; 128]).unwrap();
        drop(file);

        assert!(matches!(
            SegmentReader::open(path),
            Err(TsdbError::CorruptSegment(_))
        ));
    }

    #[test]
    fn test_corrupt_block_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_segment(temp_dir.path(), 2);

        // Flip a bit inside the first data block, leaving header/index intact
        let mut data = std::fs::read(&path).unwrap();
        data[60] ^= 0xFF;
        std::fs::write(&path, &data).unwrap();

        let reader = SegmentReader::open(path).unwrap();
        let cpu = SeriesKey::new("cpu").with_tag("host", "a");
        let result = reader.read(&cpu, &TimeRange::all());
        assert!(matches!(result, Err(TsdbError::CorruptSegment(_))));
    }
}

//! Segment builder
//!
//! Writes a segment to a `.tmp` file and renames it into place once
//! fully synced, so a crash mid-write leaves no visible partial segment.

use super::{SegmentConfig, SegmentId, SegmentMeta, SeriesBlock, FORMAT_VERSION, MAGIC};
use crate::{Result, SequenceNumber, SeriesKey, Timestamp, TsdbError};
use bytes::{BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use tracing::debug;

pub struct SegmentBuilder {
    config: SegmentConfig,
    path: PathBuf,
    id: SegmentId,
    level: u32,
    blocks: Vec<SeriesBlock>,
    point_count: usize,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    max_seq: SequenceNumber,
}

struct IndexEntry {
    key: String,
    offset: u64,
    size: u32,
    min_timestamp: Timestamp,
    max_timestamp: Timestamp,
    max_seq: SequenceNumber,
}

impl SegmentBuilder {
    /// Start a segment at `path` (the final path, not the temp file).
    pub fn new(path: PathBuf, id: SegmentId, level: u32, config: SegmentConfig) -> Self {
        Self {
            config,
            path,
            id,
            level,
            blocks: Vec::new(),
            point_count: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_seq: 0,
        }
    }

    /// Add one series' points, sorted by timestamp. Series must be added
    /// in key order; the buffer snapshot and compaction merge both
    /// iterate in that order.
    pub fn add_series(
        &mut self,
        series: SeriesKey,
        points: &[(Timestamp, f64, SequenceNumber)],
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.blocks.last() {
            if last.series >= series {
                return Err(TsdbError::InvalidFormat(format!(
                    "Series added out of order: {}",
                    series
                )));
            }
        }

        let block = SeriesBlock::build(series, points);
        self.point_count += block.count;
        self.min_timestamp = self.min_timestamp.min(block.min_timestamp);
        self.max_timestamp = self.max_timestamp.max(block.max_timestamp);
        self.max_seq = self.max_seq.max(block.max_seq);
        self.blocks.push(block);
        Ok(())
    }

    /// Number of points added so far
    pub fn len(&self) -> usize {
        self.point_count
    }

    pub fn is_empty(&self) -> bool {
        self.point_count == 0
    }

    /// Write the segment and atomically move it into place.
    pub fn finish(self) -> Result<SegmentMeta> {
        let tmp_path = self.path.with_extension("tmp");
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        let mut offset = 0u64;

        offset += self.write_header(&mut file)? as u64;

        let mut index = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let bytes = block.to_bytes(self.config.use_lz4);
            index.push(IndexEntry {
                key: block.series.canonical(),
                offset,
                size: bytes.len() as u32,
                min_timestamp: block.min_timestamp,
                max_timestamp: block.max_timestamp,
                max_seq: block.max_seq,
            });
            file.write_all(&bytes)?;
            offset += bytes.len() as u64;
        }

        let index_offset = offset;
        let index_size = self.write_index(&mut file, &index)? as u64;
        offset += index_size;
        offset += self.write_footer(&mut file, index_offset, index_size)? as u64;

        file.flush()?;
        file.get_ref().sync_all()?;
        drop(file);

        // Visible only once complete
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            id = self.id,
            level = self.level,
            points = self.point_count,
            bytes = offset,
            "segment written"
        );

        Ok(SegmentMeta {
            path: self.path,
            id: self.id,
            level: self.level,
            point_count: self.point_count,
            file_size: offset,
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            max_seq: self.max_seq,
        })
    }

    fn write_header(&self, file: &mut BufWriter<File>) -> Result<usize> {
        let mut buf = BytesMut::new();
        buf.put_slice(MAGIC);
        buf.put_u32_le(FORMAT_VERSION);
        buf.put_u32_le(self.level);
        buf.put_u64_le(self.point_count as u64);
        buf.put_i64_le(self.min_timestamp);
        buf.put_i64_le(self.max_timestamp);
        buf.put_u64_le(self.max_seq);

        file.write_all(&buf)?;
        Ok(buf.len())
    }

    fn write_index(&self, file: &mut BufWriter<File>, index: &[IndexEntry]) -> Result<usize> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(index.len() as u32);
        for entry in index {
            buf.put_u16_le(entry.key.len() as u16);
            buf.put_slice(entry.key.as_bytes());
            buf.put_u64_le(entry.offset);
            buf.put_u32_le(entry.size);
            buf.put_i64_le(entry.min_timestamp);
            buf.put_i64_le(entry.max_timestamp);
            buf.put_u64_le(entry.max_seq);
        }

        file.write_all(&buf)?;
        Ok(buf.len())
    }

    fn write_footer(
        &self,
        file: &mut BufWriter<File>,
        index_offset: u64,
        index_size: u64,
    ) -> Result<usize> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(index_offset);
        buf.put_u64_le(index_size);
        buf.put_slice(MAGIC);

        file.write_all(&buf)?;
        Ok(buf.len())
    }
}

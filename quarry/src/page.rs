//! The layout of a page on disk.
//!
//! A data page starts with a big-endian `i32` record count, followed by the
//! encoded records packed back to back. Bytes past the live data are zero.
//! Index pages carry one serialized tree node and do not use the count slot.
use crate::codec::{RecordCodec, RecordError};
use crate::types::Record;
use crate::{PageNum, TableId};

/// Width of the record count at the start of a data page.
pub const COUNT_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PageRegion {
    Data,
    Index,
}

impl PageRegion {
    pub fn dir_name(self) -> &'static str {
        match self {
            PageRegion::Data => "pages",
            PageRegion::Index => "index",
        }
    }
}

/// Identity of a page: which file it lives in and where.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub region: PageRegion,
    pub table_id: TableId,
    pub page_num: PageNum,
}

impl PageKey {
    pub fn data(table_id: TableId, page_num: PageNum) -> Self {
        Self {
            region: PageRegion::Data,
            table_id,
            page_num,
        }
    }

    pub fn index(table_id: TableId, page_num: PageNum) -> Self {
        Self {
            region: PageRegion::Index,
            table_id,
            page_num,
        }
    }
}

/// Decoded records of a page with the byte offset each one starts at.
#[derive(Debug, Clone, Default)]
pub struct PageLayout {
    pub records: Vec<Record>,
    pub offsets: Vec<usize>,
    /// Offset one past the last live byte.
    pub end: usize,
}

/// A fixed-size block of bytes read from and written to disk.
#[derive(Debug, Clone)]
pub struct Page {
    pub key: PageKey,
    pub data: Box<[u8]>,
}

impl Page {
    pub fn new(key: PageKey, page_size: usize) -> Self {
        Self {
            key,
            data: vec![0; page_size].into_boxed_slice(),
        }
    }

    pub fn from_bytes(key: PageKey, data: Box<[u8]>) -> Self {
        Self { key, data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Stored record count. A negative value on disk reads as zero.
    pub fn record_count(&self) -> usize {
        let raw = i32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        raw.max(0) as usize
    }

    pub fn set_record_count(&mut self, count: usize) {
        self.data[..COUNT_SIZE].copy_from_slice(&(count as i32).to_be_bytes());
    }

    /// Decodes up to `limit` records from the start of the page.
    pub fn read(&self, codec: &RecordCodec, limit: Option<usize>) -> Result<Vec<Record>, RecordError> {
        let count = limit.map_or(self.record_count(), |l| l.min(self.record_count()));
        let mut buf = &self.data[COUNT_SIZE..];
        (0..count).map(|_| codec.decode(&mut buf)).collect()
    }

    pub fn read_with_offsets(&self, codec: &RecordCodec) -> Result<PageLayout, RecordError> {
        let count = self.record_count();
        let mut layout = PageLayout {
            records: Vec::with_capacity(count),
            offsets: Vec::with_capacity(count),
            end: COUNT_SIZE,
        };
        let mut buf = &self.data[COUNT_SIZE..];
        for _ in 0..count {
            layout.offsets.push(self.size() - buf.len());
            layout.records.push(codec.decode(&mut buf)?);
        }
        layout.end = self.size() - buf.len();
        Ok(layout)
    }

    /// Offset one past the last live byte.
    pub fn live_size(&self, codec: &RecordCodec) -> Result<usize, RecordError> {
        let mut buf = &self.data[COUNT_SIZE..];
        for _ in 0..self.record_count() {
            codec.decode(&mut buf)?;
        }
        Ok(self.size() - buf.len())
    }

    pub fn free_space(&self, codec: &RecordCodec) -> Result<usize, RecordError> {
        Ok(self.size() - self.live_size(codec)?)
    }

    /// Writes `records[start..]` after the live data until the next record
    /// would not fit. Returns how many records were written.
    pub fn write(
        &mut self,
        codec: &RecordCodec,
        records: &[Record],
        start: usize,
    ) -> Result<usize, RecordError> {
        let mut end = self.live_size(codec)?;
        let mut written = 0;
        for record in records.iter().skip(start) {
            let encoded = codec.encode(record)?;
            if !self.append_encoded(end, &encoded) {
                break;
            }
            end += encoded.len();
            written += 1;
        }
        Ok(written)
    }

    /// Places already encoded bytes at `end` and bumps the count. Returns
    /// false, leaving the page untouched, when they do not fit.
    pub fn append_encoded(&mut self, end: usize, encoded: &[u8]) -> bool {
        if end + encoded.len() > self.size() {
            return false;
        }
        self.data[end..end + encoded.len()].copy_from_slice(encoded);
        self.set_record_count(self.record_count() + 1);
        true
    }

    /// Opens a gap at `offset` by moving `[offset, live_end)` right, writes
    /// `encoded` into it and bumps the count. Returns false, leaving the page
    /// untouched, when there is no room.
    pub fn shift_insert(&mut self, offset: usize, live_end: usize, encoded: &[u8]) -> bool {
        debug_assert!(COUNT_SIZE <= offset && offset <= live_end);
        let len = encoded.len();
        if live_end + len > self.size() {
            return false;
        }
        self.data.copy_within(offset..live_end, offset + len);
        self.data[offset..offset + len].copy_from_slice(encoded);
        self.set_record_count(self.record_count() + 1);
        true
    }

    /// Keeps the first `count` records, which end at `offset`, and zeroes the
    /// rest of the page.
    pub fn truncate_records(&mut self, count: usize, offset: usize) {
        self.data[offset..].fill(0);
        self.set_record_count(count);
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

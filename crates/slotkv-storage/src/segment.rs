//! Log segment files.
//!
//! A segment is an append-only `NNNNN.seg` file: an 8-byte header
//! followed by records. Its counters live next to it in `NNNNN.seg.meta`.

use crate::meta::{read_json, write_json};
use crate::mmap::{FileStat, MmapFile};
use crate::{META_EXT, Result, SEGMENT_EXT, StorageError};
use serde::{Deserialize, Serialize};
use slotkv_formats::{
    FileHeader, FileKind, FormatError, RecordKind, SEGMENT_HEADER_SIZE, decode_record,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Record counters of one segment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    /// Records appended to the segment, puts and deletes alike.
    pub total_records: u32,
    /// Records that are no longer live: superseded puts and delete records.
    pub deleted_records: u32,
    /// Encoded bytes of the records counted in `deleted_records`.
    pub deleted_bytes: u64,
    /// No further records will be appended.
    pub full: bool,
}

/// One log segment.
#[derive(Debug)]
pub struct Segment {
    id: u16,
    file: Arc<MmapFile>,
    meta: SegmentMeta,
    meta_path: PathBuf,
}

impl Segment {
    /// File name of segment `id`.
    pub fn file_name(id: u16) -> String {
        format!("{id:05}.{SEGMENT_EXT}")
    }

    /// Parse a segment id from a file name like `00042.seg`.
    pub fn parse_file_name(name: &str) -> Option<u16> {
        let stem = name.strip_suffix(SEGMENT_EXT)?.strip_suffix('.')?;
        if stem.len() != 5 || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        stem.parse().ok()
    }

    /// Open segment `id` in `dir`, creating it if missing.
    ///
    /// A file too short to hold its header is reset to an empty segment.
    pub fn open(dir: &Path, id: u16) -> Result<Self> {
        let path = dir.join(Self::file_name(id));
        let file = MmapFile::create(&path)?;

        if file.size() < SEGMENT_HEADER_SIZE as u64 {
            if file.size() > 0 {
                warn!(
                    "Segment {} has a torn header ({} bytes), resetting",
                    path.display(),
                    file.size()
                );
            }
            file.truncate(0)?;
            file.append(&FileHeader::new(FileKind::Segment).to_bytes()?)?;
        } else {
            let header = file.slice_at(0, SEGMENT_HEADER_SIZE)?;
            FileHeader::parse(&header, FileKind::Segment)?;
        }

        let meta_path = dir.join(format!("{}.{META_EXT}", Self::file_name(id)));
        let meta = read_json(&meta_path)?.unwrap_or_default();
        debug!("Opened segment {} ({} bytes)", id, file.size());

        Ok(Self {
            id,
            file: Arc::new(file),
            meta,
            meta_path,
        })
    }

    /// Segment id.
    pub const fn id(&self) -> u16 {
        self.id
    }

    /// Current file length, header included.
    pub fn size(&self) -> u64 {
        self.file.size()
    }

    /// Whether the segment holds no records.
    pub fn is_empty(&self) -> bool {
        self.size() <= SEGMENT_HEADER_SIZE as u64
    }

    /// Record counters.
    pub const fn meta(&self) -> &SegmentMeta {
        &self.meta
    }

    /// Mutable record counters.
    pub const fn meta_mut(&mut self) -> &mut SegmentMeta {
        &mut self.meta
    }

    /// Backing file.
    pub fn file(&self) -> &Arc<MmapFile> {
        &self.file
    }

    /// Name, size and modification time of the segment file.
    pub fn stat(&self) -> Result<FileStat> {
        self.file.stat()
    }

    /// Append an encoded record and return its offset.
    pub fn append(&self, record: &[u8]) -> Result<u64> {
        self.file.append(record)
    }

    /// Persist the counters.
    pub fn save_meta(&self) -> Result<()> {
        write_json(&self.meta_path, &self.meta)
    }

    /// Flush the segment file and its counters.
    pub fn sync(&self) -> Result<()> {
        self.file.sync()?;
        self.save_meta()
    }

    /// Cursor over the records of this segment.
    pub fn cursor(&self) -> SegmentIterator {
        SegmentIterator::new(self)
    }
}

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Put or delete.
    pub kind: RecordKind,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Value bytes, empty for deletes.
    pub value: Vec<u8>,
    /// Segment the record was read from.
    pub segment_id: u16,
    /// Offset of the record within the segment.
    pub offset: u32,
}

/// Outcome of reading the next record of a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordRead {
    /// A complete, valid record.
    Record(Record),
    /// The cursor sits exactly at the end of the file.
    EndOfData,
    /// The file ends inside a record.
    UnexpectedEnd,
    /// The bytes at the cursor are not a valid record.
    Corrupted(String),
}

/// Sequential reader over one segment.
///
/// Holds its own reference to the segment file, so the segment itself can
/// be mutated while the cursor is alive.
#[derive(Debug)]
pub struct SegmentIterator {
    segment_id: u16,
    file: Arc<MmapFile>,
    offset: u64,
}

impl SegmentIterator {
    /// Cursor positioned at the first record of `segment`.
    pub fn new(segment: &Segment) -> Self {
        Self {
            segment_id: segment.id,
            file: Arc::clone(&segment.file),
            offset: SEGMENT_HEADER_SIZE as u64,
        }
    }

    /// Segment being read.
    pub const fn segment_id(&self) -> u16 {
        self.segment_id
    }

    /// Offset just past the last record returned.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Backing file.
    pub fn file(&self) -> &Arc<MmapFile> {
        &self.file
    }

    /// Read the record at the cursor.
    ///
    /// I/O failures are returned as errors; damaged or incomplete records
    /// are reported through [`RecordRead`] and leave the cursor in place.
    pub fn next_record(&mut self) -> Result<RecordRead> {
        let size = self.file.size();
        if self.offset >= size {
            return Ok(RecordRead::EndOfData);
        }

        let Ok(offset) = u32::try_from(self.offset) else {
            return Err(StorageError::Corruption(format!(
                "segment {} extends past the addressable range",
                self.segment_id
            )));
        };

        let window = self.file.slice_at(self.offset, (size - self.offset) as usize)?;
        let read = match decode_record(&window) {
            Ok(record) => {
                let len = record.encoded_len() as u64;
                let record = Record {
                    kind: record.kind,
                    key: record.key.to_vec(),
                    value: record.value.to_vec(),
                    segment_id: self.segment_id,
                    offset,
                };
                self.offset += len;
                RecordRead::Record(record)
            }
            Err(FormatError::Incomplete { .. }) => RecordRead::UnexpectedEnd,
            Err(e) => RecordRead::Corrupted(e.to_string()),
        };
        Ok(read)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use slotkv_formats::encode_record;
    use tempfile::TempDir;

    fn expect_record(it: &mut SegmentIterator) -> Record {
        match it.next_record().expect("read") {
            RecordRead::Record(record) => record,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(Segment::file_name(0), "00000.seg");
        assert_eq!(Segment::file_name(65534), "65534.seg");
        assert_eq!(Segment::parse_file_name("00042.seg"), Some(42));
        assert_eq!(Segment::parse_file_name("00042.seg.meta"), None);
        assert_eq!(Segment::parse_file_name("42.seg"), None);
        assert_eq!(Segment::parse_file_name("main.idx"), None);
        assert_eq!(Segment::parse_file_name("99999.seg"), None);
    }

    #[test]
    fn test_new_segment_has_header_only() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let segment = Segment::open(dir.path(), 3).expect("open");

        assert_eq!(segment.size(), SEGMENT_HEADER_SIZE as u64);
        assert!(segment.is_empty());
        assert_eq!(segment.cursor().next_record().expect("read"), RecordRead::EndOfData);
    }

    #[test]
    fn test_records_read_back_in_order() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let segment = Segment::open(dir.path(), 0).expect("open");
        let first = segment
            .append(&encode_record(RecordKind::Put, b"a", b"1").expect("encode"))
            .expect("append");
        let second = segment
            .append(&encode_record(RecordKind::Delete, b"a", b"").expect("encode"))
            .expect("append");

        let mut it = segment.cursor();
        let record = expect_record(&mut it);
        assert_eq!(record.kind, RecordKind::Put);
        assert_eq!(record.key, b"a");
        assert_eq!(record.value, b"1");
        assert_eq!(u64::from(record.offset), first);

        let record = expect_record(&mut it);
        assert_eq!(record.kind, RecordKind::Delete);
        assert_eq!(u64::from(record.offset), second);

        assert_eq!(it.next_record().expect("read"), RecordRead::EndOfData);
        assert_eq!(it.offset(), segment.size());
    }

    #[test]
    fn test_partial_tail_is_unexpected_end() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let segment = Segment::open(dir.path(), 0).expect("open");
        segment
            .append(&encode_record(RecordKind::Put, b"a", b"1").expect("encode"))
            .expect("append");
        let valid_end = segment.size();
        let torn = encode_record(RecordKind::Put, b"b", b"2").expect("encode");
        segment.append(&torn[..5]).expect("append");

        let mut it = segment.cursor();
        expect_record(&mut it);
        assert_eq!(it.next_record().expect("read"), RecordRead::UnexpectedEnd);
        assert_eq!(it.offset(), valid_end);
    }

    #[test]
    fn test_garbage_is_corrupted() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let segment = Segment::open(dir.path(), 0).expect("open");
        let mut record = encode_record(RecordKind::Put, b"key", b"value").expect("encode");
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        segment.append(&record).expect("append");

        let mut it = segment.cursor();
        assert!(matches!(
            it.next_record().expect("read"),
            RecordRead::Corrupted(_)
        ));
        assert_eq!(it.offset(), SEGMENT_HEADER_SIZE as u64);
    }

    #[test]
    fn test_meta_persists() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut segment = Segment::open(dir.path(), 1).expect("open");
        segment.meta_mut().total_records = 5;
        segment.meta_mut().full = true;
        segment.sync().expect("sync");
        drop(segment);

        let segment = Segment::open(dir.path(), 1).expect("reopen");
        assert_eq!(
            segment.meta(),
            &SegmentMeta {
                total_records: 5,
                deleted_records: 0,
                deleted_bytes: 0,
                full: true,
            }
        );
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        std::fs::write(dir.path().join("00000.seg"), b"NOPE\x01\x00\x00\x00").expect("write");

        assert!(matches!(
            Segment::open(dir.path(), 0),
            Err(StorageError::Format(FormatError::InvalidHeader(_)))
        ));
    }
}

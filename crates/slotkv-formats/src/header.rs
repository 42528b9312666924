//! File headers.
//!
//! Every file written by the store starts with an 8-byte header:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0x00   | 4    | Magic (identifies the file kind) |
//! | 0x04   | 4    | Format version (LE) |
//!
//! Segment files place their first record right after the header. Index
//! files reserve a full bucket page for it so that bucket pages stay
//! 512-byte aligned and offset 0 never addresses a bucket.

use crate::{FormatError, Result};
use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use std::io::Cursor;

/// Size of the header at the start of a segment file.
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Kind of file a header belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Append-only log segment (`.seg`).
    Segment,
    /// Directly addressed index buckets (`main.idx`).
    MainIndex,
    /// Overflow bucket pages (`overflow.idx`).
    OverflowIndex,
}

impl FileKind {
    /// Magic bytes identifying this kind of file.
    pub const fn magic(self) -> [u8; 4] {
        match self {
            Self::Segment => *b"SKVS",
            Self::MainIndex => *b"SKVI",
            Self::OverflowIndex => *b"SKVO",
        }
    }
}

/// Magic + version prefix of a store file.
#[derive(Debug, Clone, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct FileHeader {
    /// File kind magic.
    pub magic: [u8; 4],
    /// Format version.
    pub version: u32,
}

impl FileHeader {
    /// Header for a new file of the given kind.
    pub const fn new(kind: FileKind) -> Self {
        Self {
            magic: kind.magic(),
            version: FORMAT_VERSION,
        }
    }

    /// Serialize to 8 bytes.
    pub fn to_bytes(&self) -> Result<[u8; SEGMENT_HEADER_SIZE]> {
        let mut cursor = Cursor::new(Vec::with_capacity(SEGMENT_HEADER_SIZE));
        cursor.write_le(self)?;

        let mut buf = [0u8; SEGMENT_HEADER_SIZE];
        buf.copy_from_slice(cursor.get_ref());
        Ok(buf)
    }

    /// Parse and validate a header of the expected kind.
    pub fn parse(data: &[u8], kind: FileKind) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_SIZE {
            return Err(FormatError::Incomplete {
                needed: SEGMENT_HEADER_SIZE,
                available: data.len(),
            });
        }

        let header: Self = Cursor::new(&data[..SEGMENT_HEADER_SIZE]).read_le()?;

        if header.magic != kind.magic() {
            return Err(FormatError::InvalidHeader(format!(
                "expected {kind:?} magic {:?}, found {:?}",
                kind.magic(),
                header.magic
            )));
        }
        if header.version != FORMAT_VERSION {
            return Err(FormatError::UnsupportedVersion(header.version));
        }

        Ok(header)
    }
}

//! On-disk formats for the slotkv store
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_possible_wrap)] // Page offsets are stored signed
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
//! This crate provides the byte-level codecs shared by the storage engine.
//! Nothing here touches files: every function maps a byte buffer to a
//! value or back.
//!
//! # Formats
//!
//! - **Bucket**: 512-byte hash index page holding 31 slots and an overflow link
//! - **Record**: checksummed put/delete entry appended to a log segment
//! - **Header**: magic + version prefix of every segment and index file
//!
//! All multi-byte integers are little-endian and fixed width.

#![warn(missing_docs)]

pub mod bucket;
pub mod header;
pub mod record;

pub use bucket::{BUCKET_SIZE, Bucket, SLOT_SIZE, SLOTS_PER_BUCKET, Slot, align512};
pub use header::{FORMAT_VERSION, FileHeader, FileKind, SEGMENT_HEADER_SIZE};
pub use record::{
    MAX_KEY_SIZE, MAX_VALUE_SIZE, RECORD_CHECKSUM_SIZE, RECORD_HEADER_SIZE, RecordHeader,
    RecordKind, RecordRef, decode_record, encode_record, encoded_record_len,
};

use thiserror::Error;

/// Result type for codec operations.
pub type Result<T> = std::result::Result<T, FormatError>;

/// Errors produced while encoding or decoding on-disk structures.
#[derive(Debug, Error)]
pub enum FormatError {
    /// binrw failed to read or write a header.
    #[error("Binary format error: {0}")]
    Binary(#[from] binrw::Error),

    /// The buffer ends before the structure it declares.
    #[error("Incomplete data: need {needed} bytes, have {available}")]
    Incomplete {
        /// Bytes required by the declared structure.
        needed: usize,
        /// Bytes actually present.
        available: usize,
    },

    /// Stored checksum does not match the record contents.
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum stored on disk.
        expected: u32,
        /// Checksum computed from the data.
        actual: u32,
    },

    /// Header fields are inconsistent.
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// File header carries an unknown format version.
    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    /// Key length is zero or exceeds [`MAX_KEY_SIZE`].
    #[error("Invalid key size: {0}")]
    InvalidKeySize(usize),

    /// Value length exceeds [`MAX_VALUE_SIZE`].
    #[error("Invalid value size: {0}")]
    InvalidValueSize(usize),
}

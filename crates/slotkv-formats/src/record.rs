//! Log records.
//!
//! Segments are a sequence of self-delimiting records:
//!
//! | Offset  | Size | Field |
//! |---------|------|-------|
//! | 0x00    | 2    | Key size (LE) |
//! | 0x02    | 4    | Value size (LE); bit 31 marks a delete record |
//! | 0x06    | k    | Key |
//! | 0x06+k  | v    | Value (absent for deletes) |
//! | end-4   | 4    | CRC-32 of every preceding byte of the record (LE) |
//!
//! A record that runs past the end of the buffer decodes as
//! [`FormatError::Incomplete`]; a record whose checksum or header does not
//! hold together decodes as [`FormatError::ChecksumMismatch`] or
//! [`FormatError::InvalidHeader`]. Recovery treats both as the end of the
//! usable log.

use crate::{FormatError, Result};
use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use crc32fast::Hasher as Crc32;
use std::io::Cursor;

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 6;

/// Size of the trailing checksum.
pub const RECORD_CHECKSUM_SIZE: usize = 4;

/// Largest accepted key.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Largest accepted value (512 MiB).
pub const MAX_VALUE_SIZE: usize = 512 << 20;

const DELETE_FLAG: u32 = 0x8000_0000;

/// Mutation kind of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Key was set to a value.
    Put,
    /// Key was removed.
    Delete,
}

/// Fixed 6-byte record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, BinRead, BinWrite)]
#[brw(little)]
pub struct RecordHeader {
    /// Key length in bytes.
    pub key_size: u16,
    /// Value length with the delete flag in bit 31.
    raw_value_size: u32,
}

impl RecordHeader {
    /// Build a header for a record of the given kind and sizes.
    pub const fn new(kind: RecordKind, key_size: u16, value_size: u32) -> Self {
        let raw_value_size = match kind {
            RecordKind::Put => value_size,
            RecordKind::Delete => value_size | DELETE_FLAG,
        };
        Self {
            key_size,
            raw_value_size,
        }
    }

    /// Record kind encoded in the header.
    pub const fn kind(&self) -> RecordKind {
        if self.raw_value_size & DELETE_FLAG == 0 {
            RecordKind::Put
        } else {
            RecordKind::Delete
        }
    }

    /// Value length in bytes.
    pub const fn value_size(&self) -> u32 {
        self.raw_value_size & !DELETE_FLAG
    }

    /// Total encoded length of the record this header describes.
    pub const fn encoded_len(&self) -> usize {
        encoded_record_len(self.key_size as usize, self.value_size() as usize)
    }

    fn validate(&self) -> Result<()> {
        if self.key_size == 0 {
            return Err(FormatError::InvalidHeader("empty key".to_string()));
        }
        let value_size = self.value_size() as usize;
        if value_size > MAX_VALUE_SIZE {
            return Err(FormatError::InvalidHeader(format!(
                "value size {value_size} exceeds {MAX_VALUE_SIZE}"
            )));
        }
        if self.kind() == RecordKind::Delete && value_size != 0 {
            return Err(FormatError::InvalidHeader(format!(
                "delete record carries {value_size} value bytes"
            )));
        }
        Ok(())
    }
}

/// Encoded length of a record with the given key and value sizes.
pub const fn encoded_record_len(key_size: usize, value_size: usize) -> usize {
    RECORD_HEADER_SIZE + key_size + value_size + RECORD_CHECKSUM_SIZE
}

/// A decoded record borrowing its key and value from the source buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordRef<'a> {
    /// Mutation kind.
    pub kind: RecordKind,
    /// Key bytes.
    pub key: &'a [u8],
    /// Value bytes (empty for deletes).
    pub value: &'a [u8],
}

impl RecordRef<'_> {
    /// Number of bytes this record occupies in the log.
    pub const fn encoded_len(&self) -> usize {
        encoded_record_len(self.key.len(), self.value.len())
    }
}

/// Encode a record.
///
/// Delete records ignore `value`.
pub fn encode_record(kind: RecordKind, key: &[u8], value: &[u8]) -> Result<Vec<u8>> {
    if key.is_empty() || key.len() > MAX_KEY_SIZE {
        return Err(FormatError::InvalidKeySize(key.len()));
    }
    let value = match kind {
        RecordKind::Put => value,
        RecordKind::Delete => &[],
    };
    if value.len() > MAX_VALUE_SIZE {
        return Err(FormatError::InvalidValueSize(value.len()));
    }

    let header = RecordHeader::new(kind, key.len() as u16, value.len() as u32);
    let mut cursor = Cursor::new(Vec::with_capacity(header.encoded_len()));
    cursor.write_le(&header)?;

    let mut buf = cursor.into_inner();
    buf.extend_from_slice(key);
    buf.extend_from_slice(value);

    let mut hasher = Crc32::new();
    hasher.update(&buf);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode the record at the start of `data`.
///
/// Trailing bytes after the record are ignored.
pub fn decode_record(data: &[u8]) -> Result<RecordRef<'_>> {
    if data.len() < RECORD_HEADER_SIZE {
        return Err(FormatError::Incomplete {
            needed: RECORD_HEADER_SIZE,
            available: data.len(),
        });
    }

    let header: RecordHeader = Cursor::new(&data[..RECORD_HEADER_SIZE]).read_le()?;
    header.validate()?;

    let total = header.encoded_len();
    if data.len() < total {
        return Err(FormatError::Incomplete {
            needed: total,
            available: data.len(),
        });
    }

    let body_end = total - RECORD_CHECKSUM_SIZE;
    let expected = u32::from_le_bytes([
        data[body_end],
        data[body_end + 1],
        data[body_end + 2],
        data[body_end + 3],
    ]);
    let mut hasher = Crc32::new();
    hasher.update(&data[..body_end]);
    let actual = hasher.finalize();
    if expected != actual {
        return Err(FormatError::ChecksumMismatch { expected, actual });
    }

    let key_end = RECORD_HEADER_SIZE + header.key_size as usize;
    Ok(RecordRef {
        kind: header.kind(),
        key: &data[RECORD_HEADER_SIZE..key_end],
        value: &data[key_end..body_end],
    })
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_put_layout() {
        let bytes = encode_record(RecordKind::Put, b"key", b"value").expect("encode");

        assert_eq!(bytes.len(), encoded_record_len(3, 5));
        assert_eq!(&bytes[0..2], &3u16.to_le_bytes());
        assert_eq!(&bytes[2..6], &5u32.to_le_bytes());
        assert_eq!(&bytes[6..9], b"key");
        assert_eq!(&bytes[9..14], b"value");
    }

    #[test]
    fn test_delete_sets_flag_and_drops_value() {
        let bytes = encode_record(RecordKind::Delete, b"key", b"ignored").expect("encode");

        assert_eq!(bytes.len(), encoded_record_len(3, 0));
        assert_eq!(&bytes[2..6], &0x8000_0000u32.to_le_bytes());

        let record = decode_record(&bytes).expect("decode");
        assert_eq!(record.kind, RecordKind::Delete);
        assert_eq!(record.key, b"key");
        assert!(record.value.is_empty());
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = encode_record(RecordKind::Put, b"a", b"1").expect("encode");
        let len = bytes.len();
        bytes.extend_from_slice(&encode_record(RecordKind::Put, b"b", b"2").expect("encode"));

        let record = decode_record(&bytes).expect("decode");
        assert_eq!(record.key, b"a");
        assert_eq!(record.value, b"1");
        assert_eq!(record.encoded_len(), len);
    }

    #[test]
    fn test_truncated_payload_is_incomplete() {
        let bytes = encode_record(RecordKind::Put, b"key", b"value").expect("encode");

        for cut in [0, 3, RECORD_HEADER_SIZE, bytes.len() - 1] {
            assert!(
                matches!(
                    decode_record(&bytes[..cut]),
                    Err(FormatError::Incomplete { .. })
                ),
                "cut at {cut} should be incomplete"
            );
        }
    }

    #[test]
    fn test_flipped_bit_is_checksum_mismatch() {
        let mut bytes = encode_record(RecordKind::Put, b"key", b"value").expect("encode");
        bytes[10] ^= 0x01;

        assert!(matches!(
            decode_record(&bytes),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_zeroed_tail_is_invalid() {
        // Preallocated or torn zero bytes must not parse as a record
        assert!(matches!(
            decode_record(&[0u8; 32]),
            Err(FormatError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_delete_with_value_is_invalid() {
        let mut bytes = encode_record(RecordKind::Delete, b"k", b"").expect("encode");
        bytes[2] = 1;
        assert!(matches!(
            decode_record(&bytes),
            Err(FormatError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_key_limits() {
        assert!(matches!(
            encode_record(RecordKind::Put, b"", b"v"),
            Err(FormatError::InvalidKeySize(0))
        ));
        let key = vec![b'k'; MAX_KEY_SIZE + 1];
        assert!(matches!(
            encode_record(RecordKind::Put, &key, b"v"),
            Err(FormatError::InvalidKeySize(_))
        ));
        let key = vec![b'k'; MAX_KEY_SIZE];
        assert!(encode_record(RecordKind::Put, &key, b"v").is_ok());
    }
}

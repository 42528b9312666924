//! Hash index slots and bucket pages.
//!
//! A bucket is one 512-byte page: 31 fixed-size slots followed by the
//! file offset of the bucket's overflow page.
//!
//! Layout (512 bytes total):
//!
//! | Offset     | Size | Field |
//! |------------|------|-------|
//! | 16·i + 0x0 | 4    | Key hash |
//! | 16·i + 0x4 | 2    | Segment ID |
//! | 16·i + 0x6 | 2    | Key size |
//! | 16·i + 0x8 | 4    | Value size |
//! | 16·i + 0xC | 4    | Record offset within the segment |
//! | 0x1F0      | 8    | Next overflow page (signed, `<= 0` = none) |
//! | 0x1F8      | 8    | Padding |
//!
//! Occupied slots always form a prefix of the page: inserts go to the
//! first free slot and [`Bucket::delete`] shifts the tail left.

/// Number of slots in one bucket page.
pub const SLOTS_PER_BUCKET: usize = 31;

/// Size of a serialized slot in bytes.
pub const SLOT_SIZE: usize = 16;

/// Size of a serialized bucket page in bytes.
pub const BUCKET_SIZE: usize = 512;

// Field offsets within a slot.
const SLOT_HASH: usize = 0x0;
const SLOT_SEGMENT_ID: usize = 0x4;
const SLOT_KEY_SIZE: usize = 0x6;
const SLOT_VALUE_SIZE: usize = 0x8;
const SLOT_OFFSET: usize = 0xC;

/// Offset of the overflow link within a page.
const BUCKET_NEXT: usize = SLOTS_PER_BUCKET * SLOT_SIZE;

/// Round a byte length up to the next multiple of [`BUCKET_SIZE`].
pub const fn align512(n: u64) -> u64 {
    (n + 511) & !511
}

/// Directory entry pointing at one record in the log.
///
/// Records never start at offset 0 because every segment begins with a
/// file header, so a zero offset marks an unused slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    /// Hash of the record key.
    pub hash: u32,
    /// Segment holding the record.
    pub segment_id: u16,
    /// Key length in bytes.
    pub key_size: u16,
    /// Value length in bytes.
    pub value_size: u32,
    /// Byte offset of the record within its segment.
    pub offset: u32,
}

impl Slot {
    /// The all-zero slot.
    pub const EMPTY: Self = Self {
        hash: 0,
        segment_id: 0,
        key_size: 0,
        value_size: 0,
        offset: 0,
    };

    /// Whether this slot is unused.
    pub const fn is_empty(&self) -> bool {
        self.offset == 0
    }

    /// Combined key and value length.
    ///
    /// Value sizes are capped well below `u32::MAX - u16::MAX`, so the sum
    /// cannot overflow.
    pub fn kv_size(&self) -> u32 {
        u32::from(self.key_size) + self.value_size
    }

    /// Serialize to 16 bytes.
    pub fn to_bytes(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        buf[SLOT_HASH..SLOT_HASH + 4].copy_from_slice(&self.hash.to_le_bytes());
        buf[SLOT_SEGMENT_ID..SLOT_SEGMENT_ID + 2].copy_from_slice(&self.segment_id.to_le_bytes());
        buf[SLOT_KEY_SIZE..SLOT_KEY_SIZE + 2].copy_from_slice(&self.key_size.to_le_bytes());
        buf[SLOT_VALUE_SIZE..SLOT_VALUE_SIZE + 4].copy_from_slice(&self.value_size.to_le_bytes());
        buf[SLOT_OFFSET..SLOT_OFFSET + 4].copy_from_slice(&self.offset.to_le_bytes());
        buf
    }

    /// Deserialize from 16 bytes.
    pub fn from_bytes(data: &[u8; SLOT_SIZE]) -> Self {
        Self {
            hash: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            segment_id: u16::from_le_bytes([data[4], data[5]]),
            key_size: u16::from_le_bytes([data[6], data[7]]),
            value_size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
            offset: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
        }
    }
}

/// One hash index page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bucket {
    /// Slots in insertion order; empty slots trail.
    pub slots: [Slot; SLOTS_PER_BUCKET],
    /// Offset of the overflow page, `<= 0` when there is none.
    pub next: i64,
}

impl Bucket {
    /// Serialize to a full 512-byte page.
    pub fn to_bytes(&self) -> [u8; BUCKET_SIZE] {
        let mut buf = [0u8; BUCKET_SIZE];

        for (i, slot) in self.slots.iter().enumerate() {
            let start = i * SLOT_SIZE;
            buf[start..start + SLOT_SIZE].copy_from_slice(&slot.to_bytes());
        }
        buf[BUCKET_NEXT..BUCKET_NEXT + 8].copy_from_slice(&self.next.to_le_bytes());

        buf
    }

    /// Parse a page.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than [`BUCKET_SIZE`]. Callers slice whole
    /// pages from the file, so a short buffer is a bug.
    pub fn from_bytes(data: &[u8]) -> Self {
        assert!(
            data.len() >= BUCKET_SIZE,
            "bucket page needs {BUCKET_SIZE} bytes, got {}",
            data.len()
        );

        let mut slots = [Slot::EMPTY; SLOTS_PER_BUCKET];
        for (i, slot) in slots.iter_mut().enumerate() {
            let start = i * SLOT_SIZE;
            let mut raw = [0u8; SLOT_SIZE];
            raw.copy_from_slice(&data[start..start + SLOT_SIZE]);
            *slot = Slot::from_bytes(&raw);
        }

        let mut next = [0u8; 8];
        next.copy_from_slice(&data[BUCKET_NEXT..BUCKET_NEXT + 8]);

        Self {
            slots,
            next: i64::from_le_bytes(next),
        }
    }

    /// Remove the slot at `index`, shifting later slots one position left
    /// and clearing the last one.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS_PER_BUCKET`.
    pub fn delete(&mut self, index: usize) {
        self.slots.copy_within(index + 1.., index);
        self.slots[SLOTS_PER_BUCKET - 1] = Slot::EMPTY;
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .position(Slot::is_empty)
            .unwrap_or(SLOTS_PER_BUCKET)
    }

    /// Whether no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots[0].is_empty()
    }

    /// Offset of the overflow page, if linked.
    pub const fn next_page(&self) -> Option<u64> {
        if self.next > 0 {
            Some(self.next as u64)
        } else {
            None
        }
    }

    /// Link this bucket to the overflow page at `offset`.
    pub const fn set_next_page(&mut self, offset: u64) {
        self.next = offset as i64;
    }
}

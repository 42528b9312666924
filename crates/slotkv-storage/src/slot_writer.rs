//! Slot insertion across an overflow chain.
//!
//! A [`SlotWriter`] fills slots of a tail bucket starting at a cursor. When
//! the tail is full it asks an [`OverflowAllocator`] for a fresh page,
//! links the full tail to it and continues there. Nothing is written until
//! [`SlotWriter::flush`].

use crate::Result;
use crate::bucket::BucketHandle;
use slotkv_formats::{SLOTS_PER_BUCKET, Slot};

/// Source of empty overflow pages.
pub trait OverflowAllocator {
    /// Allocate an empty overflow bucket.
    fn create_overflow_bucket(&mut self) -> Result<BucketHandle>;
}

/// Appends slots to a bucket chain, allocating overflow pages as needed.
#[derive(Debug)]
pub struct SlotWriter {
    tail: BucketHandle,
    cursor: usize,
    filled: Vec<BucketHandle>,
}

impl SlotWriter {
    /// Start writing at the first slot of `tail`.
    pub fn new(tail: BucketHandle) -> Self {
        Self::at(tail, 0)
    }

    /// Start writing at slot `cursor` of `tail`.
    ///
    /// A cursor of [`SLOTS_PER_BUCKET`] means the tail is full and the
    /// first insert allocates an overflow bucket.
    pub fn at(tail: BucketHandle, cursor: usize) -> Self {
        debug_assert!(cursor <= SLOTS_PER_BUCKET);
        Self {
            tail,
            cursor,
            filled: Vec::new(),
        }
    }

    /// Place `slot` at the cursor and advance.
    pub fn insert(&mut self, slot: Slot, allocator: &mut impl OverflowAllocator) -> Result<()> {
        if self.cursor == SLOTS_PER_BUCKET {
            let next = allocator.create_overflow_bucket()?;
            self.tail.bucket.set_next_page(next.offset());
            let full = std::mem::replace(&mut self.tail, next);
            self.filled.push(full);
            self.cursor = 0;
        }

        self.tail.bucket.slots[self.cursor] = slot;
        self.cursor += 1;
        Ok(())
    }

    /// Write every touched page: filled buckets from the most recent back
    /// to the first, then the tail.
    pub fn flush(&self) -> Result<()> {
        for handle in self.write_order() {
            handle.write()?;
        }
        Ok(())
    }

    /// Touched pages in the order [`SlotWriter::flush`] writes them:
    /// filled pages newest first, then the tail.
    pub fn write_order(&self) -> impl Iterator<Item = &BucketHandle> {
        self.filled
            .iter()
            .rev()
            .chain(std::iter::once(&self.tail))
    }

    /// Number of buckets this writer has touched.
    pub fn bucket_count(&self) -> usize {
        self.filled.len() + 1
    }
}

//! Bucket pages bound to their backing file.

use crate::Result;
use crate::mmap::MmapFile;
use slotkv_formats::{BUCKET_SIZE, Bucket};
use std::sync::Arc;

/// A bucket together with the file and offset it lives at.
///
/// The bucket is a private working copy: changes reach the file only on
/// [`BucketHandle::write`].
#[derive(Debug, Clone)]
pub struct BucketHandle {
    /// Working copy of the page.
    pub bucket: Bucket,
    file: Arc<MmapFile>,
    offset: u64,
}

impl BucketHandle {
    /// Handle to an empty bucket at `offset`, without reading the file.
    pub fn new(file: Arc<MmapFile>, offset: u64) -> Self {
        Self {
            bucket: Bucket::default(),
            file,
            offset,
        }
    }

    /// Handle loaded from the page at `offset`.
    pub fn load(file: Arc<MmapFile>, offset: u64) -> Result<Self> {
        let mut handle = Self::new(file, offset);
        handle.read()?;
        Ok(handle)
    }

    /// Replace the working copy with the page on disk.
    pub fn read(&mut self) -> Result<()> {
        let page = self.file.slice_at(self.offset, BUCKET_SIZE)?;
        self.bucket = Bucket::from_bytes(&page);
        Ok(())
    }

    /// Persist the working copy.
    pub fn write(&self) -> Result<()> {
        self.file.write_at(&self.bucket.to_bytes(), self.offset)
    }

    /// File offset of the page.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Backing file.
    pub fn file(&self) -> &Arc<MmapFile> {
        &self.file
    }
}

//! Linear-hashing index over 512-byte bucket pages.
//!
//! The index maps 32-bit key hashes to [`Slot`]s. It is stored in two
//! files, each starting with a one-page header:
//!
//! - `main.idx`: directly addressed buckets, bucket `i` at `512 + 512 * i`
//! - `overflow.idx`: overflow pages linked from a bucket's `next` field
//!
//! The table grows one bucket at a time. Once the average fill ratio
//! exceeds the load factor, the bucket at the split pointer is split: its
//! chain is redistributed between itself and a new bucket using one more
//! hash bit. Overflow pages freed by a split go on a free list that later
//! allocations draw from.
//!
//! Key comparison is delegated to the caller through a `match_key`
//! closure, which is consulted only for slots with an equal hash.

use crate::bucket::BucketHandle;
use crate::meta::{read_json, write_json};
use crate::mmap::MmapFile;
use crate::slot_writer::{OverflowAllocator, SlotWriter};
use crate::{INDEX_META_FILE, MAIN_INDEX_FILE, OVERFLOW_INDEX_FILE, Result, StorageError};
use serde::{Deserialize, Serialize};
use slotkv_formats::{
    BUCKET_SIZE, FileHeader, FileKind, SEGMENT_HEADER_SIZE as FILE_HEADER_SIZE, SLOTS_PER_BUCKET, Slot,
    align512,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes reserved for the file header at the start of each index file.
pub const INDEX_HEADER_SIZE: u64 = BUCKET_SIZE as u64;

const PAGE: u64 = BUCKET_SIZE as u64;

/// Persistent index state (`index.meta`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Number of hash bits fully split.
    pub level: u8,
    /// Keys stored in the index.
    pub num_keys: u32,
    /// Buckets in `main.idx`.
    pub num_buckets: u32,
    /// Next bucket to split.
    pub split_bucket_idx: u32,
    /// Released overflow pages available for reuse.
    pub free_overflow_buckets: Vec<u64>,
}

impl Default for IndexMeta {
    fn default() -> Self {
        Self {
            level: 0,
            num_keys: 0,
            num_buckets: 1,
            split_bucket_idx: 0,
            free_overflow_buckets: Vec::new(),
        }
    }
}

/// Hash index backed by `main.idx` and `overflow.idx`.
#[derive(Debug)]
pub struct Index {
    dir: PathBuf,
    main: Arc<MmapFile>,
    overflow: Arc<MmapFile>,
    meta: IndexMeta,
    load_factor: f64,
}

impl Index {
    /// Open the index in `dir`.
    ///
    /// Without `index.meta` the index files are reinitialized to a single
    /// empty bucket.
    pub fn open(dir: &Path, load_factor: f64) -> Result<Self> {
        let main = Arc::new(MmapFile::create(dir.join(MAIN_INDEX_FILE))?);
        let overflow = Arc::new(MmapFile::create(dir.join(OVERFLOW_INDEX_FILE))?);

        let mut index = Self {
            dir: dir.to_path_buf(),
            main,
            overflow,
            meta: IndexMeta::default(),
            load_factor,
        };

        match read_json::<IndexMeta>(&dir.join(INDEX_META_FILE))? {
            Some(meta) => {
                index.meta = meta;
                index.check_files()?;
            }
            None => index.reset()?,
        }

        debug!(
            "Opened index in {}: {} keys in {} buckets (level {})",
            dir.display(),
            index.meta.num_keys,
            index.meta.num_buckets,
            index.meta.level
        );
        Ok(index)
    }

    /// Whether `dir` holds index metadata.
    pub fn meta_exists(dir: &Path) -> bool {
        dir.join(INDEX_META_FILE).exists()
    }

    fn check_files(&self) -> Result<()> {
        for (file, kind) in [
            (&self.main, FileKind::MainIndex),
            (&self.overflow, FileKind::OverflowIndex),
        ] {
            let header = file.slice_at(0, FILE_HEADER_SIZE)?;
            FileHeader::parse(&header, kind)?;
            drop(header);

            // A torn page append leaves a partial page at the end
            let size = file.size();
            if size % PAGE != 0 {
                warn!(
                    "Index file {} has a partial page, padding to {} bytes",
                    file.path().display(),
                    align512(size)
                );
                file.extend(align512(size) - size)?;
            }
        }

        let required = self.bucket_offset(self.meta.num_buckets);
        if self.main.size() < required {
            return Err(StorageError::Corruption(format!(
                "main index holds {} bytes, {} buckets need {}",
                self.main.size(),
                self.meta.num_buckets,
                required
            )));
        }
        for &offset in &self.meta.free_overflow_buckets {
            check_overflow_offset(&self.overflow, offset)?;
        }
        Ok(())
    }

    fn init_file(file: &MmapFile, kind: FileKind) -> Result<()> {
        let mut page = [0u8; BUCKET_SIZE];
        let header = FileHeader::new(kind).to_bytes()?;
        page[..header.len()].copy_from_slice(&header);

        file.truncate(0)?;
        file.append(&page)?;
        Ok(())
    }

    /// Drop every key and shrink the index to one empty bucket.
    pub fn reset(&mut self) -> Result<()> {
        Self::init_file(&self.main, FileKind::MainIndex)?;
        Self::init_file(&self.overflow, FileKind::OverflowIndex)?;
        self.main.extend(PAGE)?;
        self.meta = IndexMeta::default();
        self.save_meta()
    }

    fn save_meta(&self) -> Result<()> {
        write_json(&self.dir.join(INDEX_META_FILE), &self.meta)
    }

    /// Current index state.
    pub const fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    /// Number of keys in the index.
    pub const fn count(&self) -> u32 {
        self.meta.num_keys
    }

    /// Overflow pages allocated in `overflow.idx`, free ones included.
    pub fn overflow_pages(&self) -> u64 {
        self.overflow.size().saturating_sub(INDEX_HEADER_SIZE) / PAGE
    }

    fn bucket_offset(&self, idx: u32) -> u64 {
        INDEX_HEADER_SIZE + u64::from(idx) * PAGE
    }

    /// Bucket a hash is addressed to under the current split state.
    pub fn bucket_index(&self, hash: u32) -> u32 {
        let level = u32::from(self.meta.level);
        let idx = low_bits(hash, level);
        if idx < self.meta.split_bucket_idx {
            low_bits(hash, level + 1)
        } else {
            idx
        }
    }

    fn chain(&self, idx: u32) -> Chain {
        Chain {
            main: Arc::clone(&self.main),
            overflow: Arc::clone(&self.overflow),
            next: Some(ChainLink::Main(self.bucket_offset(idx))),
            visited: HashSet::new(),
        }
    }

    /// Look up the slot for `hash` whose key satisfies `match_key`.
    pub fn get<F>(&self, hash: u32, mut match_key: F) -> Result<Option<Slot>>
    where
        F: FnMut(&Slot) -> Result<bool>,
    {
        for handle in self.chain(self.bucket_index(hash)) {
            let handle = handle?;
            for slot in &handle.bucket.slots[..handle.bucket.len()] {
                if slot.hash == hash && match_key(slot)? {
                    return Ok(Some(*slot));
                }
            }
        }
        Ok(None)
    }

    /// Insert `slot`, replacing the slot of the same key if present.
    ///
    /// Returns the replaced slot. New keys may trigger a split.
    pub fn put<F>(&mut self, slot: Slot, mut match_key: F) -> Result<Option<Slot>>
    where
        F: FnMut(&Slot) -> Result<bool>,
    {
        let mut free = None;
        let mut last = None;

        for handle in self.chain(self.bucket_index(slot.hash)) {
            let mut handle = handle?;
            let len = handle.bucket.len();
            for i in 0..len {
                let existing = handle.bucket.slots[i];
                if existing.hash == slot.hash && match_key(&existing)? {
                    handle.bucket.slots[i] = slot;
                    handle.write()?;
                    return Ok(Some(existing));
                }
            }
            if free.is_none() && len < SLOTS_PER_BUCKET {
                free = Some((handle.clone(), len));
            }
            last = Some(handle);
        }

        if self.meta.num_keys == u32::MAX {
            return Err(StorageError::IndexFull);
        }

        let mut writer = match (free, last) {
            (Some((handle, cursor)), _) => SlotWriter::at(handle, cursor),
            (None, Some(tail)) => SlotWriter::at(tail, SLOTS_PER_BUCKET),
            (None, None) => {
                return Err(StorageError::Corruption(
                    "bucket chain yielded no pages".to_string(),
                ));
            }
        };
        writer.insert(slot, self)?;
        writer.flush()?;

        self.meta.num_keys += 1;
        if self.needs_split() {
            self.split()?;
        }
        Ok(None)
    }

    /// Remove the slot for `hash` whose key satisfies `match_key`.
    pub fn delete<F>(&mut self, hash: u32, mut match_key: F) -> Result<Option<Slot>>
    where
        F: FnMut(&Slot) -> Result<bool>,
    {
        for handle in self.chain(self.bucket_index(hash)) {
            let mut handle = handle?;
            for i in 0..handle.bucket.len() {
                let existing = handle.bucket.slots[i];
                if existing.hash == hash && match_key(&existing)? {
                    let num_keys = self.meta.num_keys.checked_sub(1).ok_or_else(|| {
                        StorageError::Corruption(
                            "index meta counts no keys but a slot was found".to_string(),
                        )
                    })?;
                    handle.bucket.delete(i);
                    handle.write()?;
                    self.meta.num_keys = num_keys;
                    return Ok(Some(existing));
                }
            }
        }
        Ok(None)
    }

    fn needs_split(&self) -> bool {
        let capacity = f64::from(self.meta.num_buckets) * SLOTS_PER_BUCKET as f64;
        f64::from(self.meta.num_keys) / capacity > self.load_factor
    }

    /// Split the bucket at the split pointer.
    fn split(&mut self) -> Result<()> {
        let level = u32::from(self.meta.level);
        let update_idx = self.meta.split_bucket_idx;
        let new_idx = self.meta.num_buckets;

        let mut slots = Vec::new();
        let mut released = Vec::new();
        for handle in self.chain(update_idx) {
            let handle = handle?;
            if !Arc::ptr_eq(handle.file(), &self.main) {
                released.push(handle.offset());
            }
            slots.extend_from_slice(&handle.bucket.slots[..handle.bucket.len()]);
        }
        self.meta.free_overflow_buckets.extend(released);

        let mut update_writer = SlotWriter::new(BucketHandle::new(
            Arc::clone(&self.main),
            self.bucket_offset(update_idx),
        ));
        let mut new_writer = SlotWriter::new(BucketHandle::new(
            Arc::clone(&self.main),
            self.bucket_offset(new_idx),
        ));

        for slot in slots {
            if low_bits(slot.hash, level + 1) == update_idx {
                update_writer.insert(slot, self)?;
            } else {
                new_writer.insert(slot, self)?;
            }
        }
        update_writer.flush()?;
        new_writer.flush()?;

        self.meta.num_buckets += 1;
        self.meta.split_bucket_idx += 1;
        if u64::from(self.meta.split_bucket_idx) == 1u64 << level {
            self.meta.level += 1;
            self.meta.split_bucket_idx = 0;
        }

        debug!(
            "Split bucket {} into {} (level {}, {} buckets)",
            update_idx, new_idx, self.meta.level, self.meta.num_buckets
        );
        Ok(())
    }

    /// Flush both index files and persist the metadata.
    pub fn sync(&self) -> Result<()> {
        self.main.sync()?;
        self.overflow.sync()?;
        self.save_meta()
    }

    /// Flush everything before shutdown.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        debug!("Closed index in {}", self.dir.display());
        Ok(())
    }
}

impl OverflowAllocator for Index {
    fn create_overflow_bucket(&mut self) -> Result<BucketHandle> {
        let offset = match self.meta.free_overflow_buckets.pop() {
            Some(offset) => offset,
            None => self.overflow.extend(PAGE)?,
        };
        Ok(BucketHandle::new(Arc::clone(&self.overflow), offset))
    }
}

/// Lowest `bits` bits of `hash`.
fn low_bits(hash: u32, bits: u32) -> u32 {
    if bits >= u32::BITS {
        hash
    } else {
        hash & ((1u32 << bits) - 1)
    }
}

fn check_overflow_offset(overflow: &MmapFile, offset: u64) -> Result<()> {
    let in_range = offset
        .checked_add(PAGE)
        .is_some_and(|end| end <= overflow.size());
    if offset < INDEX_HEADER_SIZE || offset % PAGE != 0 || !in_range {
        return Err(StorageError::Corruption(format!(
            "overflow offset {offset} is outside the overflow file"
        )));
    }
    Ok(())
}

enum ChainLink {
    Main(u64),
    Overflow(u64),
}

/// Pages of one bucket chain, head first.
///
/// Fails with [`StorageError::Corruption`] instead of looping when a link
/// points back into the chain or outside the overflow file.
struct Chain {
    main: Arc<MmapFile>,
    overflow: Arc<MmapFile>,
    next: Option<ChainLink>,
    visited: HashSet<u64>,
}

impl Chain {
    fn load(&mut self, link: ChainLink) -> Result<BucketHandle> {
        let handle = match link {
            ChainLink::Main(offset) => BucketHandle::load(Arc::clone(&self.main), offset)?,
            ChainLink::Overflow(offset) => {
                if !self.visited.insert(offset) {
                    return Err(StorageError::Corruption(format!(
                        "overflow chain revisits page {offset}"
                    )));
                }
                check_overflow_offset(&self.overflow, offset)?;
                BucketHandle::load(Arc::clone(&self.overflow), offset)?
            }
        };
        self.next = handle.bucket.next_page().map(ChainLink::Overflow);
        Ok(handle)
    }
}

impl Iterator for Chain {
    type Item = Result<BucketHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        let link = self.next.take()?;
        Some(self.load(link))
    }
}

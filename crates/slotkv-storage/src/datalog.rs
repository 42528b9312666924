//! The set of log segments of one database.
//!
//! Records are appended to the active segment. When a record would push
//! the active segment past the configured size, the segment is marked full
//! and a new one with the next id becomes active.

use crate::config::StorageConfig;
use crate::segment::Segment;
use crate::{MAX_SEGMENT_ID, Result, StorageError};
use slotkv_formats::{
    RECORD_HEADER_SIZE, RecordKind, SEGMENT_HEADER_SIZE, Slot, encode_record, encoded_record_len,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only log spread over numbered segment files.
#[derive(Debug)]
pub struct Datalog {
    dir: PathBuf,
    max_segment_size: u32,
    segments: BTreeMap<u16, Segment>,
    active: u16,
}

impl Datalog {
    /// Open every segment in the database directory.
    ///
    /// An empty directory gets segment 0. The segment with the highest id
    /// is the active one.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let dir = config.path.clone();
        let mut segments = BTreeMap::new();

        for id in segment_ids(&dir)? {
            segments.insert(id, Segment::open(&dir, id)?);
        }
        if segments.is_empty() {
            segments.insert(0, Segment::open(&dir, 0)?);
        }

        let active = segments.keys().next_back().copied().unwrap_or_default();
        info!(
            "Opened datalog in {} with {} segments (active {})",
            dir.display(),
            segments.len(),
            active
        );

        Ok(Self {
            dir,
            max_segment_size: config.max_segment_size,
            segments,
            active,
        })
    }

    /// Whether any segment file in `dir` holds at least one record byte.
    pub fn has_records(dir: &Path) -> Result<bool> {
        for id in segment_ids(dir)? {
            let len = fs::metadata(dir.join(Segment::file_name(id)))?.len();
            if len > SEGMENT_HEADER_SIZE as u64 {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append a put record and return its location.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(u16, u32)> {
        let record = encode_record(RecordKind::Put, key, value)?;
        let (id, offset) = self.write_record(&record)?;
        self.segment_mut(id)?.meta_mut().total_records += 1;
        Ok((id, offset))
    }

    /// Append a delete record for `key`.
    pub fn del(&mut self, key: &[u8]) -> Result<()> {
        let record = encode_record(RecordKind::Delete, key, &[])?;
        let (id, _) = self.write_record(&record)?;
        self.track_delete_record(id, key.len())
    }

    fn write_record(&mut self, record: &[u8]) -> Result<(u16, u32)> {
        let needs_rotation = {
            let active = self.active_segment()?;
            active.meta().full
                || (!active.is_empty()
                    && active.size() + record.len() as u64 > u64::from(self.max_segment_size))
        };
        if needs_rotation {
            self.rotate()?;
        }

        let active = self.active_segment()?;
        let offset = active.append(record)?;
        let offset = u32::try_from(offset).map_err(|_| {
            StorageError::Corruption(format!(
                "segment {} grew past the addressable range",
                active.id()
            ))
        })?;
        Ok((active.id(), offset))
    }

    fn rotate(&mut self) -> Result<()> {
        let next = self
            .active
            .checked_add(1)
            .filter(|&id| id <= MAX_SEGMENT_ID)
            .ok_or(StorageError::SegmentLimit)?;

        let active = self.active_segment_mut()?;
        active.meta_mut().full = true;
        active.sync()?;

        let segment = Segment::open(&self.dir, next)?;
        self.segments.insert(next, segment);
        self.active = next;
        debug!("Rotated datalog to segment {}", next);
        Ok(())
    }

    fn active_segment(&self) -> Result<&Segment> {
        self.segment(self.active)
    }

    fn active_segment_mut(&mut self) -> Result<&mut Segment> {
        let id = self.active;
        self.segment_mut(id)
    }

    /// Segment with the given id.
    pub fn segment(&self, id: u16) -> Result<&Segment> {
        self.segments
            .get(&id)
            .ok_or_else(|| StorageError::Corruption(format!("segment {id} does not exist")))
    }

    /// Mutable segment with the given id.
    pub fn segment_mut(&mut self, id: u16) -> Result<&mut Segment> {
        self.segments
            .get_mut(&id)
            .ok_or_else(|| StorageError::Corruption(format!("segment {id} does not exist")))
    }

    /// All segments in id order.
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Id of the segment receiving appends.
    pub const fn active_id(&self) -> u16 {
        self.active
    }

    /// Key bytes of the record a slot points at.
    pub fn read_key(&self, slot: &Slot) -> Result<Vec<u8>> {
        let segment = self.segment(slot.segment_id)?;
        let start = u64::from(slot.offset) + RECORD_HEADER_SIZE as u64;
        let key = segment.file().slice_at(start, usize::from(slot.key_size))?;
        Ok(key.to_vec())
    }

    /// Value bytes of the record a slot points at.
    pub fn read_value(&self, slot: &Slot) -> Result<Vec<u8>> {
        let segment = self.segment(slot.segment_id)?;
        let start =
            u64::from(slot.offset) + RECORD_HEADER_SIZE as u64 + u64::from(slot.key_size);
        let value = segment
            .file()
            .slice_at(start, slot.value_size as usize)?;
        Ok(value.to_vec())
    }

    /// Whether the record a slot points at carries exactly `key`.
    pub fn key_matches(&self, slot: &Slot, key: &[u8]) -> Result<bool> {
        if usize::from(slot.key_size) != key.len() {
            return Ok(false);
        }
        let segment = self.segment(slot.segment_id)?;
        let start = u64::from(slot.offset) + RECORD_HEADER_SIZE as u64;
        let stored = segment.file().slice_at(start, key.len())?;
        Ok(*stored == *key)
    }

    /// Count a put record replayed from the log.
    pub fn track_put(&mut self, slot: &Slot) -> Result<()> {
        self.segment_mut(slot.segment_id)?.meta_mut().total_records += 1;
        Ok(())
    }

    /// Count the record a slot points at as no longer live.
    pub fn track_del(&mut self, slot: &Slot) -> Result<()> {
        let len = encoded_record_len(usize::from(slot.key_size), slot.value_size as usize);
        let meta = self.segment_mut(slot.segment_id)?.meta_mut();
        meta.deleted_records += 1;
        meta.deleted_bytes += len as u64;
        Ok(())
    }

    /// Count a delete record stored in segment `id`.
    ///
    /// Delete records are dead as soon as they are written, so they count
    /// towards both totals.
    pub fn track_delete_record(&mut self, id: u16, key_size: usize) -> Result<()> {
        let meta = self.segment_mut(id)?.meta_mut();
        meta.total_records += 1;
        meta.deleted_records += 1;
        meta.deleted_bytes += encoded_record_len(key_size, 0) as u64;
        Ok(())
    }

    /// Segments ordered by file modification time, oldest first.
    ///
    /// Ties are broken by segment id.
    pub fn segments_by_modification(&self) -> Result<Vec<&Segment>> {
        let mut ordered = Vec::with_capacity(self.segments.len());
        for segment in self.segments.values() {
            ordered.push((segment.stat()?.modified, segment));
        }
        ordered.sort_by_key(|(modified, segment)| (*modified, segment.id()));
        Ok(ordered.into_iter().map(|(_, segment)| segment).collect())
    }

    /// Zero the record counters of every segment.
    ///
    /// The `full` flag is kept: it reflects rotation, not record contents.
    pub fn reset_meta(&mut self) {
        for segment in self.segments.values_mut() {
            let meta = segment.meta_mut();
            meta.total_records = 0;
            meta.deleted_records = 0;
            meta.deleted_bytes = 0;
        }
    }

    /// Flush the active segment and every segment's counters.
    pub fn sync(&self) -> Result<()> {
        for segment in self.segments.values() {
            if segment.id() == self.active {
                segment.sync()?;
            } else {
                segment.save_meta()?;
            }
        }
        Ok(())
    }

    /// Flush everything before shutdown.
    pub fn close(&self) -> Result<()> {
        self.sync()?;
        debug!("Closed datalog in {}", self.dir.display());
        Ok(())
    }
}

/// Ids of the segment files in `dir`, ascending.
fn segment_ids(dir: &Path) -> Result<Vec<u16>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(id) = entry
            .file_name()
            .to_str()
            .and_then(Segment::parse_file_name)
            .filter(|&id| id <= MAX_SEGMENT_ID)
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

//! Crash recovery.
//!
//! After an unclean shutdown the index cannot be trusted. Recovery sets
//! the index files aside, starts from an empty index and replays every
//! segment in the order the segments were last written:
//!
//! - put records are inserted through the normal index put path
//! - delete records remove the matching key
//!
//! A segment whose tail does not decode (a torn append or damaged bytes)
//! is truncated right after its last valid record and replay moves on to
//! the next segment.

use crate::datalog::Datalog;
use crate::segment::{Record, RecordRead, SegmentIterator};
use crate::{INDEX_EXT, META_EXT, RECOVERY_DIR, Result};
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Why a segment was cut short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TruncationReason {
    /// The file ended inside a record.
    UnexpectedEnd,
    /// A record failed validation.
    Corrupted(String),
}

/// A segment tail discarded during recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationEvent {
    /// Segment that was truncated.
    pub segment_id: u16,
    /// Segment file name.
    pub file_name: String,
    /// New file length, just past the last valid record.
    pub offset: u64,
    /// Bytes removed from the end of the file.
    pub discarded: u64,
    /// What stopped the replay of this segment.
    pub reason: TruncationReason,
}

/// Receives progress notifications from a [`RecoveryIterator`].
pub trait RecoveryObserver {
    /// Replay of a segment starts.
    fn segment_opened(&mut self, _segment_id: u16, _file_name: &str) {}

    /// A segment tail was discarded.
    fn segment_truncated(&mut self, _event: &TruncationEvent) {}

    /// Replay of a segment finished after `records` valid records.
    fn segment_finished(&mut self, _segment_id: u16, _records: u64) {}
}

impl<T: RecoveryObserver + ?Sized> RecoveryObserver for &mut T {
    fn segment_opened(&mut self, segment_id: u16, file_name: &str) {
        (**self).segment_opened(segment_id, file_name);
    }

    fn segment_truncated(&mut self, event: &TruncationEvent) {
        (**self).segment_truncated(event);
    }

    fn segment_finished(&mut self, segment_id: u16, records: u64) {
        (**self).segment_finished(segment_id, records);
    }
}

/// Observer that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RecoveryObserver for NoopObserver {}

/// Observer that reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RecoveryObserver for TracingObserver {
    fn segment_opened(&mut self, segment_id: u16, file_name: &str) {
        debug!("Replaying segment {} ({})", segment_id, file_name);
    }

    fn segment_truncated(&mut self, event: &TruncationEvent) {
        warn!(
            "Truncated data file {} to offset {} ({} bytes discarded: {:?})",
            event.file_name, event.offset, event.discarded, event.reason
        );
    }

    fn segment_finished(&mut self, segment_id: u16, records: u64) {
        debug!("Segment {} replayed {} records", segment_id, records);
    }
}

/// Outcome of a recovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Valid records replayed.
    pub records: u64,
    /// Put records replayed.
    pub puts: u64,
    /// Delete records replayed.
    pub deletes: u64,
    /// Segment tails that were discarded.
    pub truncated: Vec<TruncationEvent>,
}

/// Records of every segment, oldest segment first.
///
/// Each segment is read until its first undecodable record; the file is
/// then truncated to the end of the last valid record and the iterator
/// moves on. I/O errors end the iteration after being yielded once.
#[derive(Debug)]
pub struct RecoveryIterator<O = TracingObserver> {
    pending: VecDeque<SegmentIterator>,
    current: Option<SegmentIterator>,
    current_records: u64,
    observer: O,
    truncations: Vec<TruncationEvent>,
    failed: bool,
}

impl<O: RecoveryObserver> RecoveryIterator<O> {
    /// Iterator over the segments of `datalog` in modification order.
    pub fn new(datalog: &Datalog, observer: O) -> Result<Self> {
        let pending = datalog
            .segments_by_modification()?
            .into_iter()
            .map(SegmentIterator::new)
            .collect();

        Ok(Self {
            pending,
            current: None,
            current_records: 0,
            observer,
            truncations: Vec::new(),
            failed: false,
        })
    }

    /// Truncations performed so far.
    pub fn truncations(&self) -> &[TruncationEvent] {
        &self.truncations
    }

    /// Consume the iterator, returning the truncations it performed.
    pub fn into_truncations(self) -> Vec<TruncationEvent> {
        self.truncations
    }

    fn advance(&mut self) -> Result<Option<Record>> {
        loop {
            let read = match self.current.as_mut() {
                Some(segment) => segment.next_record()?,
                None => {
                    let Some(next) = self.pending.pop_front() else {
                        return Ok(None);
                    };
                    let name = next.file().stat()?.name;
                    self.observer.segment_opened(next.segment_id(), &name);
                    self.current = Some(next);
                    self.current_records = 0;
                    continue;
                }
            };

            match read {
                RecordRead::Record(record) => {
                    self.current_records += 1;
                    return Ok(Some(record));
                }
                RecordRead::EndOfData => self.finish_segment(None)?,
                RecordRead::UnexpectedEnd => {
                    self.finish_segment(Some(TruncationReason::UnexpectedEnd))?;
                }
                RecordRead::Corrupted(message) => {
                    self.finish_segment(Some(TruncationReason::Corrupted(message)))?;
                }
            }
        }
    }

    /// Cut the current segment after its last valid record and close it.
    fn finish_segment(&mut self, reason: Option<TruncationReason>) -> Result<()> {
        let Some(segment) = self.current.take() else {
            return Ok(());
        };

        let offset = segment.offset();
        let stat = segment.file().stat()?;
        if stat.size != offset {
            // Replay order follows modification time, which a cut must not move
            segment.file().truncate(offset)?;
            segment.file().set_modified(stat.modified)?;
        }

        if let Some(reason) = reason
            && stat.size > offset
        {
            let event = TruncationEvent {
                segment_id: segment.segment_id(),
                file_name: stat.name,
                offset,
                discarded: stat.size - offset,
                reason,
            };
            self.observer.segment_truncated(&event);
            self.truncations.push(event);
        }

        self.observer
            .segment_finished(segment.segment_id(), self.current_records);
        Ok(())
    }
}

impl<O: RecoveryObserver> Iterator for RecoveryIterator<O> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(record) => record.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Move every index and metadata file of `dir` into a fresh
/// `recovery/<unix-millis>/` directory and return its path.
///
/// Segment files and the lock marker stay where they are.
pub fn backup_non_segment_files(dir: &Path) -> Result<PathBuf> {
    info!("Moving non-segment files out of {}", dir.display());

    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut backup = dir.join(RECOVERY_DIR).join(millis.to_string());
    let mut attempt = 0;
    while backup.exists() {
        attempt += 1;
        backup = dir.join(RECOVERY_DIR).join(format!("{millis}-{attempt}"));
    }
    fs::create_dir_all(&backup)?;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let path = entry.path();
        let is_backed_up = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext == INDEX_EXT || ext == META_EXT);
        if !is_backed_up {
            continue;
        }

        let target = backup.join(entry.file_name());
        fs::rename(&path, &target)?;
        debug!("Moved {} to {}", path.display(), target.display());
    }

    Ok(backup)
}

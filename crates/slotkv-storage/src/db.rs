//! The key-value store.
//!
//! [`Db`] ties the datalog and the index together. Writes append to the
//! log first and then update the index; reads go through the index and
//! fetch the value from the log.
//!
//! A lock marker file exists for as long as the store is open. Finding it
//! at open time means the previous process never reached [`Db::close`], so
//! the index is set aside and rebuilt from the log.

use crate::config::StorageConfig;
use crate::datalog::Datalog;
use crate::index::Index;
use crate::meta::{read_json, write_json};
use crate::recovery::{
    RecoveryIterator, RecoveryObserver, RecoveryReport, TracingObserver,
    backup_non_segment_files,
};
use crate::{DB_META_FILE, LOCK_FILE, Result, StorageError};
use serde::{Deserialize, Serialize};
use slotkv_formats::{MAX_KEY_SIZE, MAX_VALUE_SIZE, RecordKind, Slot};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use twox_hash::XxHash32;

/// Persistent store settings (`db.meta`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct DbMeta {
    hash_seed: u32,
}

/// Summary of the store contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DbStats {
    /// Live keys.
    pub keys: u32,
    /// Segment files.
    pub segments: usize,
    /// Bytes across all segment files.
    pub log_bytes: u64,
    /// Records across all segments.
    pub total_records: u64,
    /// Records that are no longer live.
    pub deleted_records: u64,
    /// Bytes of records that are no longer live.
    pub deleted_bytes: u64,
    /// Buckets in the main index file.
    pub index_buckets: u32,
    /// Overflow pages allocated.
    pub overflow_pages: u64,
}

/// Embedded key-value store.
///
/// Methods that change the store take `&mut self`; the caller serializes
/// writers.
#[derive(Debug)]
pub struct Db {
    config: StorageConfig,
    datalog: Datalog,
    index: Index,
    seed: u32,
    lock_path: PathBuf,
}

impl Db {
    /// Open or create the store in `config.path`.
    ///
    /// Recovers the index when the previous process did not close the
    /// store, or when the index is missing while the log has records.
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.path.clone();
        fs::create_dir_all(&dir)?;

        let lock_path = dir.join(LOCK_FILE);
        let crashed = lock_path.exists();
        File::create(&lock_path)?;

        let meta_path = dir.join(DB_META_FILE);
        let meta = match read_json::<DbMeta>(&meta_path)? {
            Some(meta) => meta,
            None => DbMeta {
                hash_seed: rand::random(),
            },
        };

        let needs_recovery = if crashed {
            warn!("{} was not closed cleanly", dir.display());
            true
        } else if !Index::meta_exists(&dir) && Datalog::has_records(&dir)? {
            warn!("{} has log records but no index", dir.display());
            true
        } else {
            false
        };

        if needs_recovery {
            let backup = backup_non_segment_files(&dir)?;
            info!("Index files moved to {}", backup.display());
        }
        write_json(&meta_path, &meta)?;

        let datalog = Datalog::open(&config)?;
        let index = Index::open(&dir, config.load_factor)?;

        let mut db = Self {
            config,
            datalog,
            index,
            seed: meta.hash_seed,
            lock_path,
        };

        if needs_recovery {
            db.recover()?;
        }

        info!(
            "Opened store in {} with {} keys",
            dir.display(),
            db.index.count()
        );
        Ok(db)
    }

    /// Directory the store lives in.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// 32-bit xxHash of `key` under the store's seed.
    pub fn hash(&self, key: &[u8]) -> u32 {
        XxHash32::oneshot(self.seed, key)
    }

    fn check_key(key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey("key is empty".to_string()));
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(StorageError::InvalidKey(format!(
                "key of {} bytes exceeds {}",
                key.len(),
                MAX_KEY_SIZE
            )));
        }
        Ok(())
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        Self::check_key(key)?;
        if value.len() > MAX_VALUE_SIZE {
            return Err(StorageError::InvalidValue(format!(
                "value of {} bytes exceeds {}",
                value.len(),
                MAX_VALUE_SIZE
            )));
        }

        let (segment_id, offset) = self.datalog.put(key, value)?;
        let slot = Slot {
            hash: self.hash(key),
            segment_id,
            key_size: key.len() as u16,
            value_size: value.len() as u32,
            offset,
        };

        let datalog = &self.datalog;
        let previous = self
            .index
            .put(slot, |candidate| datalog.key_matches(candidate, key))?;
        if let Some(previous) = previous {
            self.datalog.track_del(&previous)?;
        }

        if self.config.sync_writes {
            self.datalog.sync()?;
        }
        Ok(())
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.lookup(key)? {
            Some(slot) => Ok(Some(self.datalog.read_value(&slot)?)),
            None => Ok(None),
        }
    }

    /// Whether `key` is present.
    pub fn has(&self, key: &[u8]) -> Result<bool> {
        Ok(self.lookup(key)?.is_some())
    }

    fn lookup(&self, key: &[u8]) -> Result<Option<Slot>> {
        if key.is_empty() || key.len() > MAX_KEY_SIZE {
            return Ok(None);
        }
        let datalog = &self.datalog;
        self.index
            .get(self.hash(key), |candidate| datalog.key_matches(candidate, key))
    }

    /// Remove `key`. Returns whether it was present.
    ///
    /// Removing an absent key writes nothing to the log.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        Self::check_key(key)?;

        let hash = self.hash(key);
        let datalog = &self.datalog;
        let removed = self
            .index
            .delete(hash, |candidate| datalog.key_matches(candidate, key))?;
        let Some(removed) = removed else {
            return Ok(false);
        };

        self.datalog.del(key)?;
        self.datalog.track_del(&removed)?;
        if self.config.sync_writes {
            self.datalog.sync()?;
        }
        Ok(true)
    }

    /// Number of live keys.
    pub const fn count(&self) -> u32 {
        self.index.count()
    }

    /// Flush the log, the index and all metadata.
    pub fn sync(&self) -> Result<()> {
        self.datalog.sync()?;
        self.index.sync()
    }

    /// Summary of the store contents.
    pub fn stats(&self) -> DbStats {
        let mut stats = DbStats {
            keys: self.index.count(),
            index_buckets: self.index.meta().num_buckets,
            overflow_pages: self.index.overflow_pages(),
            ..DbStats::default()
        };
        for segment in self.datalog.segments() {
            let meta = segment.meta();
            stats.segments += 1;
            stats.log_bytes += segment.size();
            stats.total_records += u64::from(meta.total_records);
            stats.deleted_records += u64::from(meta.deleted_records);
            stats.deleted_bytes += meta.deleted_bytes;
        }
        stats
    }

    /// Rebuild the index from the log, reporting through `tracing`.
    pub fn recover(&mut self) -> Result<RecoveryReport> {
        self.recover_with(TracingObserver)
    }

    /// Rebuild the index from the log.
    ///
    /// The index and the segment counters are cleared first, so repeated
    /// runs over the same log produce the same index.
    pub fn recover_with<O: RecoveryObserver>(&mut self, observer: O) -> Result<RecoveryReport> {
        info!("Started recovery of {}", self.config.path.display());
        self.index.reset()?;
        self.datalog.reset_meta();

        let mut report = RecoveryReport::default();
        let mut records = RecoveryIterator::new(&self.datalog, observer)?;

        for record in records.by_ref() {
            let record = record?;
            let hash = self.hash(&record.key);
            let datalog = &self.datalog;

            match record.kind {
                RecordKind::Put => {
                    let slot = Slot {
                        hash,
                        segment_id: record.segment_id,
                        key_size: record.key.len() as u16,
                        value_size: record.value.len() as u32,
                        offset: record.offset,
                    };
                    let previous = self
                        .index
                        .put(slot, |candidate| datalog.key_matches(candidate, &record.key))?;
                    if let Some(previous) = previous {
                        self.datalog.track_del(&previous)?;
                    }
                    self.datalog.track_put(&slot)?;
                    report.puts += 1;
                }
                RecordKind::Delete => {
                    let removed = self
                        .index
                        .delete(hash, |candidate| datalog.key_matches(candidate, &record.key))?;
                    if let Some(removed) = removed {
                        self.datalog.track_del(&removed)?;
                    }
                    self.datalog
                        .track_delete_record(record.segment_id, record.key.len())?;
                    report.deletes += 1;
                }
            }
            report.records += 1;
        }

        report.truncated = records.into_truncations();
        self.sync()?;

        info!(
            "Recovered {} records ({} puts, {} deletes, {} truncated segments), {} keys",
            report.records,
            report.puts,
            report.deletes,
            report.truncated.len(),
            self.index.count()
        );
        Ok(report)
    }

    /// Flush everything and release the lock marker.
    pub fn close(self) -> Result<()> {
        self.index.close()?;
        self.datalog.close()?;
        fs::remove_file(&self.lock_path)?;
        debug!("Closed store in {}", self.config.path.display());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Db {
        Db::open(StorageConfig::new(dir.path())).expect("open")
    }

    #[test]
    fn test_put_get_overwrite_delete() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);

        db.put(b"k", b"v1").expect("put");
        db.put(b"k", b"v2").expect("put");
        assert_eq!(db.get(b"k").expect("get"), Some(b"v2".to_vec()));
        assert_eq!(db.count(), 1);

        assert!(db.delete(b"k").expect("delete"));
        assert!(!db.delete(b"k").expect("delete"));
        assert_eq!(db.get(b"k").expect("get"), None);
        assert!(!db.has(b"k").expect("has"));
        assert_eq!(db.count(), 0);
    }

    #[test]
    fn test_empty_value() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);

        db.put(b"empty", b"").expect("put");
        assert_eq!(db.get(b"empty").expect("get"), Some(Vec::new()));
        assert!(db.has(b"empty").expect("has"));
    }

    #[test]
    fn test_invalid_keys() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);

        assert!(matches!(db.put(b"", b"v"), Err(StorageError::InvalidKey(_))));
        let long = vec![b'k'; MAX_KEY_SIZE + 1];
        assert!(matches!(db.put(&long, b"v"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(db.delete(b""), Err(StorageError::InvalidKey(_))));
        assert_eq!(db.get(b"").expect("get"), None);
    }

    #[test]
    fn test_delete_of_absent_key_writes_nothing() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);
        let before = db.stats().log_bytes;

        assert!(!db.delete(b"missing").expect("delete"));
        assert_eq!(db.stats().log_bytes, before);
    }

    #[test]
    fn test_stats_track_dead_records() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);
        db.put(b"a", b"1").expect("put");
        db.put(b"a", b"2").expect("put");
        db.put(b"b", b"3").expect("put");
        db.delete(b"b").expect("delete");

        let stats = db.stats();
        assert_eq!(stats.keys, 1);
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.total_records, 4);
        // Overwritten "a", deleted "b" and the delete record itself
        assert_eq!(stats.deleted_records, 3);
    }

    #[test]
    fn test_clean_close_and_reopen() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let mut db = open(&dir);
        db.put(b"x", b"1").expect("put");
        let seed = db.seed;
        db.close().expect("close");
        assert!(!dir.path().join(LOCK_FILE).exists());

        let db = open(&dir);
        assert_eq!(db.seed, seed);
        assert_eq!(db.get(b"x").expect("get"), Some(b"1".to_vec()));
        assert!(!dir.path().join(crate::RECOVERY_DIR).exists());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = StorageConfig::new(dir.path()).with_load_factor(2.0);
        assert!(matches!(Db::open(config), Err(StorageError::Config(_))));
    }
}

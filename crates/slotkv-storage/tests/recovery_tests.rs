#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Crash and recovery tests for the store
//!
//! A crash is simulated by dropping a `Db` without calling `close`, which
//! leaves the lock marker behind. The next open must rebuild the index
//! from the log alone.

use pretty_assertions::assert_eq;
use slotkv_formats::{RecordKind, SEGMENT_HEADER_SIZE, encode_record, encoded_record_len};
use slotkv_storage::{
    Db, LOCK_FILE, NoopObserver, RECOVERY_DIR, RecoveryObserver, StorageConfig, TruncationEvent,
    TruncationReason,
};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

fn config(dir: &Path) -> StorageConfig {
    StorageConfig::new(dir)
}

fn crash(db: Db) {
    drop(db);
}

fn segment_path(dir: &Path, id: u16) -> std::path::PathBuf {
    dir.join(format!("{id:05}.seg"))
}

fn append_raw(path: &Path, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .expect("open segment");
    file.write_all(bytes).expect("append");
}

fn set_mtime(path: &Path, secs: u64) {
    let file = File::options().write(true).open(path).expect("open");
    file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
        .expect("set mtime");
}

#[test]
fn put_put_delete_replays_to_final_state() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"k1", b"v1").expect("put");
    db.put(b"k1", b"v2").expect("put");
    db.put(b"k2", b"v3").expect("put");
    db.delete(b"k2").expect("delete");
    crash(db);

    assert!(dir.path().join(LOCK_FILE).exists());
    let db = Db::open(config(dir.path())).expect("reopen");

    assert_eq!(db.get(b"k1").expect("get"), Some(b"v2".to_vec()));
    assert_eq!(db.get(b"k2").expect("get"), None);
    assert_eq!(db.count(), 1);
}

#[test]
fn crash_moves_index_files_aside() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"a", b"1").expect("put");
    db.sync().expect("sync");
    crash(db);

    let _db = Db::open(config(dir.path())).expect("reopen");

    let backups: Vec<_> = fs::read_dir(dir.path().join(RECOVERY_DIR))
        .expect("recovery dir")
        .map(|e| e.expect("entry").path())
        .collect();
    assert_eq!(backups.len(), 1);
    assert!(backups[0].join("main.idx").exists());
    assert!(backups[0].join("index.meta").exists());
    assert!(backups[0].join("db.meta").exists());
    // Fresh files take their place
    assert!(dir.path().join("main.idx").exists());
    assert!(dir.path().join("db.meta").exists());
}

#[test]
fn torn_final_record_is_discarded() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"kept", b"value").expect("put");
    crash(db);

    let seg = segment_path(dir.path(), 0);
    let valid_len = fs::metadata(&seg).expect("metadata").len();
    let torn = encode_record(RecordKind::Put, b"lost", b"value").expect("encode");
    append_raw(&seg, &torn[..torn.len() - 3]);

    let db = Db::open(config(dir.path())).expect("reopen");
    assert_eq!(fs::metadata(&seg).expect("metadata").len(), valid_len);
    assert_eq!(db.get(b"kept").expect("get"), Some(b"value".to_vec()));
    assert_eq!(db.get(b"lost").expect("get"), None);
    assert_eq!(db.count(), 1);
}

#[test]
fn corrupted_segment_is_cut_and_later_segments_replayed() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let record_len = encoded_record_len(2, 2);
    let cfg = config(dir.path()).with_max_segment_size((SEGMENT_HEADER_SIZE + 2 * record_len) as u32);

    let mut db = Db::open(cfg.clone()).expect("open");
    for key in [b"k0", b"k1", b"k2", b"k3"] {
        db.put(key, b"vv").expect("put");
    }
    crash(db);

    // Damage the second record of segment 0
    let seg0 = segment_path(dir.path(), 0);
    let mut bytes = fs::read(&seg0).expect("read");
    bytes[SEGMENT_HEADER_SIZE + record_len + 7] ^= 0xFF;
    fs::write(&seg0, &bytes).expect("write");
    set_mtime(&seg0, 1_000);
    set_mtime(&segment_path(dir.path(), 1), 2_000);

    let db = Db::open(cfg).expect("reopen");
    assert_eq!(
        fs::metadata(&seg0).expect("metadata").len(),
        (SEGMENT_HEADER_SIZE + record_len) as u64
    );
    assert_eq!(db.get(b"k0").expect("get"), Some(b"vv".to_vec()));
    assert_eq!(db.get(b"k1").expect("get"), None);
    assert_eq!(db.get(b"k2").expect("get"), Some(b"vv".to_vec()));
    assert_eq!(db.get(b"k3").expect("get"), Some(b"vv".to_vec()));
}

#[test]
fn segments_replay_in_modification_order() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let record_len = encoded_record_len(3, 3);
    let cfg = config(dir.path()).with_max_segment_size((SEGMENT_HEADER_SIZE + record_len) as u32);

    let mut db = Db::open(cfg.clone()).expect("open");
    db.put(b"key", b"old").expect("put");
    db.put(b"key", b"new").expect("put");
    crash(db);

    // Pretend segment 0 was written last
    set_mtime(&segment_path(dir.path(), 0), 2_000);
    set_mtime(&segment_path(dir.path(), 1), 1_000);

    let db = Db::open(cfg).expect("reopen");
    assert_eq!(db.get(b"key").expect("get"), Some(b"old".to_vec()));
}

#[test]
fn recovery_is_idempotent() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    for i in 0..500u32 {
        db.put(format!("key-{i}").as_bytes(), &i.to_le_bytes())
            .expect("put");
    }
    for i in (0..500u32).step_by(3) {
        db.delete(format!("key-{i}").as_bytes()).expect("delete");
    }
    crash(db);

    let mut db = Db::open(config(dir.path())).expect("reopen");
    let first = db.stats();
    let report = db.recover().expect("recover again");
    let second = db.stats();

    assert_eq!(first, second);
    assert_eq!(report.records, 500 + 167);
    assert_eq!(report.puts, 500);
    assert_eq!(report.deletes, 167);
    assert!(report.truncated.is_empty());
    for i in 0..500u32 {
        let value = db.get(format!("key-{i}").as_bytes()).expect("get");
        if i % 3 == 0 {
            assert_eq!(value, None, "key-{i} should be deleted");
        } else {
            assert_eq!(value, Some(i.to_le_bytes().to_vec()), "key-{i}");
        }
    }
}

#[test]
fn recovered_counters_match_live_counters() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    for i in 0..200u32 {
        db.put(format!("k{}", i % 50).as_bytes(), format!("v{i}").as_bytes())
            .expect("put");
    }
    for i in 0..10u32 {
        db.delete(format!("k{i}").as_bytes()).expect("delete");
    }
    let live = db.stats();
    crash(db);

    let db = Db::open(config(dir.path())).expect("reopen");
    assert_eq!(db.stats(), live);
}

#[test]
fn missing_index_meta_triggers_recovery() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"a", b"1").expect("put");
    db.close().expect("close");

    fs::remove_file(dir.path().join("index.meta")).expect("remove meta");

    let db = Db::open(config(dir.path())).expect("reopen");
    assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
}

#[test]
fn clean_close_skips_recovery() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"a", b"1").expect("put");
    db.close().expect("close");

    let db = Db::open(config(dir.path())).expect("reopen");
    assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert!(!dir.path().join(RECOVERY_DIR).exists());
}

#[test]
fn observer_sees_every_segment() {
    #[derive(Default)]
    struct Seen {
        opened: Vec<u16>,
        truncated: Vec<TruncationEvent>,
    }

    impl RecoveryObserver for Seen {
        fn segment_opened(&mut self, segment_id: u16, _file_name: &str) {
            self.opened.push(segment_id);
        }

        fn segment_truncated(&mut self, event: &TruncationEvent) {
            self.truncated.push(event.clone());
        }
    }

    let dir = TempDir::new().expect("Failed to create temp dir");
    let record_len = encoded_record_len(1, 1);
    let cfg = config(dir.path()).with_max_segment_size((SEGMENT_HEADER_SIZE + record_len) as u32);
    let mut db = Db::open(cfg).expect("open");
    for key in [b"a", b"b", b"c"] {
        db.put(key, b"1").expect("put");
    }

    let mut seen = Seen::default();
    let report = db.recover_with(&mut seen).expect("recover");

    let mut opened = seen.opened.clone();
    opened.sort_unstable();
    assert_eq!(opened, vec![0, 1, 2]);
    assert!(seen.truncated.is_empty());
    assert_eq!(report.puts, 3);

    let report = db.recover_with(NoopObserver).expect("recover");
    assert_eq!(report.records, 3);
}

#[test]
fn many_keys_survive_crash_across_splits() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    for i in 0..3000u32 {
        db.put(format!("key-{i}").as_bytes(), format!("value-{i}").as_bytes())
            .expect("put");
    }
    let buckets = db.stats().index_buckets;
    assert!(buckets > 1);
    crash(db);

    let db = Db::open(config(dir.path())).expect("reopen");
    assert_eq!(db.count(), 3000);
    assert_eq!(db.stats().index_buckets, buckets);
    for i in (0..3000u32).step_by(7) {
        assert_eq!(
            db.get(format!("key-{i}").as_bytes()).expect("get"),
            Some(format!("value-{i}").into_bytes())
        );
    }
}

#[test]
fn truncation_reason_is_reported() {
    // A zeroed tail (preallocated or torn) is corruption, not a short record
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut db = Db::open(config(dir.path())).expect("open");
    db.put(b"a", b"1").expect("put");
    crash(db);

    let seg = segment_path(dir.path(), 0);
    let valid_len = fs::metadata(&seg).expect("metadata").len();
    append_raw(&seg, &[0u8; 64]);

    // Recover through the datalog directly to inspect the event
    let datalog = slotkv_storage::Datalog::open(&config(dir.path())).expect("datalog");
    let mut it = slotkv_storage::RecoveryIterator::new(&datalog, NoopObserver).expect("iterator");
    let records: Vec<_> = it.by_ref().collect::<Result<_, _>>().expect("replay");
    assert_eq!(records.len(), 1);

    let events = it.into_truncations();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].offset, valid_len);
    assert_eq!(events[0].discarded, 64);
    assert!(matches!(events[0].reason, TruncationReason::Corrupted(_)));
}

#[test]
fn second_recovery_after_cut_keeps_replay_order() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let record_len = encoded_record_len(2, 2);
    let cfg = config(dir.path()).with_max_segment_size((SEGMENT_HEADER_SIZE + 2 * record_len) as u32);

    let mut db = Db::open(cfg.clone()).expect("open");
    db.put(b"k0", b"o0").expect("put");
    db.put(b"k1", b"o1").expect("put");
    db.put(b"k0", b"n0").expect("put");
    crash(db);

    // Damage the second record of segment 0; segment 1 holds the newer k0
    let seg0 = segment_path(dir.path(), 0);
    let mut bytes = fs::read(&seg0).expect("read");
    bytes[SEGMENT_HEADER_SIZE + record_len + 7] ^= 0xFF;
    fs::write(&seg0, &bytes).expect("write");
    set_mtime(&seg0, 1_000);
    set_mtime(&segment_path(dir.path(), 1), 2_000);

    let db = Db::open(cfg.clone()).expect("first recovery");
    assert_eq!(db.get(b"k0").expect("get"), Some(b"n0".to_vec()));
    assert_eq!(db.get(b"k1").expect("get"), None);
    crash(db);

    assert_eq!(
        fs::metadata(&seg0).expect("metadata").modified().expect("mtime"),
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)
    );

    let db = Db::open(cfg).expect("second recovery");
    assert_eq!(db.get(b"k0").expect("get"), Some(b"n0".to_vec()));
    assert_eq!(db.get(b"k1").expect("get"), None);
    assert_eq!(db.count(), 1);
}

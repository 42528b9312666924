//! Embedded key-value store built on a paged hash index.
//!
//! Values live in append-only log segments; a linear-hashing index of
//! 512-byte bucket pages maps key hashes to record locations. The index is
//! a derived structure: after an unclean shutdown it is discarded and
//! rebuilt by replaying the log, truncating any torn write at the end of a
//! segment.
//!
//! # Storage Layout
//!
//! All files live directly in the database directory:
//!
//! - `NNNNN.seg` / `NNNNN.seg.meta`: log segments and their counters
//! - `main.idx` / `overflow.idx` / `index.meta`: the hash index
//! - `db.meta`: hash seed
//! - `slotkv.lock`: present while a process has the store open
//! - `recovery/<unix-millis>/`: index files set aside by a recovery
//!
//! # Example
//!
//! ```rust,no_run
//! use slotkv_storage::{Db, StorageConfig};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut db = Db::open(StorageConfig::new("/tmp/slotkv"))?;
//! db.put(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?.as_deref(), Some(&b"world"[..]));
//! db.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use thiserror::Error;

// Memory-mapped file access
pub mod mmap;

// Index pages and chain insertion
pub mod bucket;
pub mod slot_writer;

// Linear-hashing index
pub mod index;

// Log segments
pub mod datalog;
pub mod segment;

// Crash recovery
pub mod recovery;

// Store
pub mod db;

// Configuration
pub mod config;

// JSON metadata files
mod meta;

pub use bucket::BucketHandle;
pub use config::StorageConfig;
pub use datalog::Datalog;
pub use db::{Db, DbStats};
pub use index::{Index, IndexMeta};
pub use mmap::{FileStat, MmapFile};
pub use recovery::{
    NoopObserver, RecoveryIterator, RecoveryObserver, RecoveryReport, TracingObserver,
    TruncationEvent, TruncationReason,
};
pub use segment::{Record, RecordRead, Segment, SegmentIterator, SegmentMeta};
pub use slot_writer::{OverflowAllocator, SlotWriter};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure could not be encoded or decoded.
    #[error("Format error: {0}")]
    Format(#[from] slotkv_formats::FormatError),

    /// Metadata file could not be read or written.
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Corruption detected.
    #[error("Data corruption detected: {0}")]
    Corruption(String),

    /// Key is empty or too long.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Value is too long.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Index already holds `u32::MAX` keys.
    #[error("Index is full")]
    IndexFull,

    /// No segment ids left for a new segment.
    #[error("Segment limit reached")]
    SegmentLimit,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Version information for the storage system.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Main index file name.
pub const MAIN_INDEX_FILE: &str = "main.idx";

/// Overflow index file name.
pub const OVERFLOW_INDEX_FILE: &str = "overflow.idx";

/// Index metadata file name.
pub const INDEX_META_FILE: &str = "index.meta";

/// Database metadata file name.
pub const DB_META_FILE: &str = "db.meta";

/// Lock marker file name.
///
/// Created on open and removed on close; finding it at open time means the
/// previous process did not shut down cleanly.
pub const LOCK_FILE: &str = "slotkv.lock";

/// Extension of log segment files.
pub const SEGMENT_EXT: &str = "seg";

/// Extension of metadata files.
pub const META_EXT: &str = "meta";

/// Extension of index files.
pub const INDEX_EXT: &str = "idx";

/// Directory that receives index files set aside by recovery.
pub const RECOVERY_DIR: &str = "recovery";

/// Highest usable segment id.
pub const MAX_SEGMENT_ID: u16 = u16::MAX - 1;

//! Configuration for the storage system

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use slotkv_formats::{SEGMENT_HEADER_SIZE, encoded_record_len};
use std::path::{Path, PathBuf};

/// Configuration for the storage system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database directory
    pub path: PathBuf,

    /// Size at which the active segment is closed and a new one started
    pub max_segment_size: u32,

    /// Flush the log after every write
    pub sync_writes: bool,

    /// Average bucket fill ratio that triggers an index split
    pub load_factor: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            max_segment_size: u32::MAX,
            sync_writes: false,
            load_factor: 0.7,
        }
    }
}

impl StorageConfig {
    /// Create a new configuration with the specified database directory
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    /// Load a configuration from a JSON file
    ///
    /// Missing fields take their default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Set the database directory
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.path = path.as_ref().to_path_buf();
        self
    }

    /// Set the segment rotation size
    #[must_use]
    pub const fn with_max_segment_size(mut self, size: u32) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Enable or disable flushing after every write
    #[must_use]
    pub const fn with_sync_writes(mut self, enable: bool) -> Self {
        self.sync_writes = enable;
        self
    }

    /// Set the split threshold
    #[must_use]
    pub const fn with_load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Smallest segment size that fits the header and one record
    pub const fn min_segment_size() -> u32 {
        (SEGMENT_HEADER_SIZE + encoded_record_len(1, 0)) as u32
    }

    /// Check the configuration for values the store cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.max_segment_size < Self::min_segment_size() {
            return Err(StorageError::Config(format!(
                "max_segment_size {} is below the minimum of {}",
                self.max_segment_size,
                Self::min_segment_size()
            )));
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            return Err(StorageError::Config(format!(
                "load_factor {} must be in (0, 1]",
                self.load_factor
            )));
        }
        Ok(())
    }
}

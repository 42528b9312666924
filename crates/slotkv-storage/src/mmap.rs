//! Memory-mapped file access.
//!
//! Reads go through a read-only map of the whole file; writes use the file
//! handle and the map is rebuilt whenever the file length changes. The map
//! sits behind a `parking_lot` read/write lock, so slices handed out by
//! [`MmapFile::slice_at`] keep the map alive and block resizing until they
//! are dropped.

use crate::Result;
use memmap2::{Mmap, MmapOptions};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// File name, size and modification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    /// File name without directory.
    pub name: String,
    /// Length in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

struct Mapping {
    map: Option<Mmap>,
    len: u64,
}

impl Mapping {
    fn new(file: &File, len: u64) -> io::Result<Self> {
        // Zero-length files cannot be mapped on every platform
        if len == 0 {
            return Ok(Self { map: None, len });
        }

        #[allow(unsafe_code)]
        let map = unsafe { MmapOptions::new().map(file)? };

        Ok(Self {
            map: Some(map),
            len,
        })
    }
}

/// Read/write file with a shared read-only memory map.
pub struct MmapFile {
    path: PathBuf,
    file: File,
    mapping: RwLock<Mapping>,
}

impl MmapFile {
    /// Open an existing file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Self::from_file(path.as_ref(), file)
    }

    /// Open a file, creating it empty if it does not exist.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Self::from_file(path.as_ref(), file)
    }

    fn from_file(path: &Path, file: File) -> Result<Self> {
        let len = file.metadata()?.len();
        let mapping = Mapping::new(&file, len)?;
        debug!("Mapped {} ({} bytes)", path.display(), len);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            mapping: RwLock::new(mapping),
        })
    }

    /// Path the file was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length in bytes.
    pub fn size(&self) -> u64 {
        self.mapping.read().len
    }

    /// Borrow `len` bytes starting at `offset`.
    ///
    /// Fails with [`io::ErrorKind::UnexpectedEof`] when the window extends
    /// past the end of the file.
    pub fn slice_at(&self, offset: u64, len: usize) -> Result<MappedRwLockReadGuard<'_, [u8]>> {
        let guard = self.mapping.read();
        let end = offset.checked_add(len as u64);

        let window = RwLockReadGuard::try_map(guard, |mapping| {
            let end = end.filter(|&end| end <= mapping.len)?;
            match &mapping.map {
                Some(map) => map.get(offset as usize..end as usize),
                None if len == 0 => Some(&[][..]),
                None => None,
            }
        });

        window.map_err(|guard| {
            let size = guard.len;
            drop(guard);
            io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: {} bytes at offset {} exceed file size {}",
                    self.path.display(),
                    len,
                    offset,
                    size
                ),
            )
            .into()
        })
    }

    /// Write `buf` at `offset`, growing the file if needed.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;

        let end = offset + buf.len() as u64;
        if end > mapping.len {
            *mapping = Mapping::new(&self.file, end)?;
        }
        Ok(())
    }

    /// Append `buf` and return the offset it was written at.
    pub fn append(&self, buf: &[u8]) -> Result<u64> {
        let mut mapping = self.mapping.write();
        let offset = mapping.len;
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;

        *mapping = Mapping::new(&self.file, offset + buf.len() as u64)?;
        Ok(offset)
    }

    /// Grow the file by `len` zero bytes and return the old length.
    pub fn extend(&self, len: u64) -> Result<u64> {
        let mut mapping = self.mapping.write();
        let offset = mapping.len;
        mapping.map = None;
        self.file.set_len(offset + len)?;

        *mapping = Mapping::new(&self.file, offset + len)?;
        Ok(offset)
    }

    /// Cut the file to `size` bytes.
    ///
    /// Does nothing when the file already has that length.
    pub fn truncate(&self, size: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        if mapping.len == size {
            return Ok(());
        }
        mapping.map = None;
        self.file.set_len(size)?;

        *mapping = Mapping::new(&self.file, size)?;
        Ok(())
    }

    /// Flush written data to disk.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Set the modification time of the file.
    pub fn set_modified(&self, time: SystemTime) -> Result<()> {
        self.file.set_modified(time)?;
        Ok(())
    }

    /// Name, size and modification time of the file.
    pub fn stat(&self) -> Result<FileStat> {
        let metadata = self.file.metadata()?;
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(FileStat {
            name,
            size: metadata.len(),
            modified: metadata.modified()?,
        })
    }
}

impl std::fmt::Debug for MmapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapFile")
            .field("path", &self.path)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}

//! Database file I/O operations.
//!
//! All reads and writes are positional (`pread`/`pwrite` on Unix), so a single
//! `DatabaseFile` can be shared between readers and the writer without a lock
//! around the file cursor.

use std::fs::{File, OpenOptions};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::path::Path;

use crate::storage::page::{Extent, PAGE_SIZE, PAGE_SIZE_U64};
use crate::storage::superblock::{SLOT_COUNT, Superblock, SuperblockError};
use crate::storage::wal::pages_for_capacity;

/// A database file handle with positional page I/O.
pub struct DatabaseFile {
    file: File,
    #[cfg(test)]
    faults: FaultInjector,
}

impl DatabaseFile {
    /// Create a new database file at the given path.
    ///
    /// Lays out both superblock slots and a zeroed log region of at least
    /// `log_capacity` bytes. Returns an error if the file already exists.
    pub fn create(path: &Path, log_capacity: u64) -> Result<(Self, Superblock), FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    FileError::AlreadyExists(path.to_path_buf())
                } else {
                    FileError::Io(e)
                }
            })?;

        let superblock = Superblock::new(pages_for_capacity(log_capacity));
        let db = Self {
            file,
            #[cfg(test)]
            faults: FaultInjector::default(),
        };

        db.ensure_pages(superblock.total_page_count)?;
        db.write_superblock(&superblock)?;
        db.sync()?;

        Ok((db, superblock))
    }

    /// Open an existing database file and return its newest valid superblock.
    pub fn open(path: &Path) -> Result<(Self, Superblock), FileError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(FileError::Io)?;

        let len = file.metadata().map_err(FileError::Io)?.len();
        if len < SLOT_COUNT * PAGE_SIZE_U64 {
            return Err(FileError::TooShort(len));
        }

        let db = Self {
            file,
            #[cfg(test)]
            faults: FaultInjector::default(),
        };

        let slot0 = db.read_superblock_slot(0)?;
        let slot1 = db.read_superblock_slot(1)?;
        let superblock = Superblock::newest(slot0, slot1).map_err(FileError::Superblock)?;

        Ok((db, superblock))
    }

    fn read_superblock_slot(
        &self,
        slot: u64,
    ) -> Result<Result<Superblock, SuperblockError>, FileError> {
        let mut buf = vec![0u8; PAGE_SIZE];
        self.read_at(&mut buf, slot * PAGE_SIZE_U64)?;
        Ok(Superblock::decode(&buf))
    }

    /// Write the superblock to the slot selected by its generation.
    pub fn write_superblock(&self, superblock: &Superblock) -> Result<(), FileError> {
        let slot = superblock.encode();
        self.write_at(slot.as_slice(), superblock.slot() * PAGE_SIZE_U64)
    }

    /// Read `buf.len()` bytes starting at `offset`.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<(), FileError> {
        read_exact_at(&self.file, buf, offset).map_err(FileError::Io)
    }

    /// Write all of `buf` starting at `offset`.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> Result<(), FileError> {
        #[cfg(test)]
        {
            if let Some(len) = self.faults.intercept(buf.len()) {
                write_all_at(&self.file, &buf[..len], offset).map_err(FileError::Io)?;
                return Err(FileError::Io(std::io::Error::other("injected write fault")));
            }
        }

        write_all_at(&self.file, buf, offset).map_err(FileError::Io)
    }

    /// Read every page of an extent.
    pub fn read_extent(&self, extent: Extent) -> Result<Vec<u8>, FileError> {
        let mut buf = vec![0u8; extent.byte_len()];
        self.read_at(&mut buf, extent.byte_offset())?;
        Ok(buf)
    }

    /// Write a page-aligned buffer to an extent.
    pub fn write_extent(&self, extent: Extent, bytes: &[u8]) -> Result<(), FileError> {
        debug_assert_eq!(bytes.len(), extent.byte_len());
        self.write_at(bytes, extent.byte_offset())
    }

    /// Grow the file so it holds at least `total_pages` pages.
    pub fn ensure_pages(&self, total_pages: u64) -> Result<(), FileError> {
        let wanted = total_pages * PAGE_SIZE_U64;
        if self.len()? < wanted {
            self.file.set_len(wanted).map_err(FileError::Io)?;
        }
        Ok(())
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64, FileError> {
        Ok(self.file.metadata().map_err(FileError::Io)?.len())
    }

    /// Sync all pending writes to disk.
    pub fn sync(&self) -> Result<(), FileError> {
        self.file.sync_all().map_err(FileError::Io)
    }

    /// Sync file data only; used by log flushes.
    pub fn sync_data(&self) -> Result<(), FileError> {
        self.file.sync_data().map_err(FileError::Io)
    }

    #[cfg(test)]
    pub(crate) const fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

impl std::fmt::Debug for DatabaseFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseFile").finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(std::io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// One-shot write faults for crash and failure tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FaultInjector {
    armed: std::sync::atomic::AtomicBool,
    /// Bytes that reach the disk before the injected failure.
    torn_at: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl FaultInjector {
    /// Fail the next write without writing anything.
    pub(crate) fn fail_next_write(&self) {
        self.tear_next_write(0);
    }

    /// Write only the first `bytes` of the next write, then fail it.
    pub(crate) fn tear_next_write(&self, bytes: usize) {
        use std::sync::atomic::Ordering;
        self.torn_at.store(bytes, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    fn intercept(&self, len: usize) -> Option<usize> {
        use std::sync::atomic::Ordering;
        if self.armed.swap(false, Ordering::SeqCst) {
            Some(self.torn_at.load(Ordering::SeqCst).min(len))
        } else {
            None
        }
    }
}

/// Errors that can occur during file operations.
#[derive(Debug)]
pub enum FileError {
    /// I/O error.
    Io(std::io::Error),
    /// File already exists.
    AlreadyExists(std::path::PathBuf),
    /// File is too short to hold the superblock slots.
    TooShort(u64),
    /// Superblock error.
    Superblock(SuperblockError),
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::AlreadyExists(p) => write!(f, "file already exists: {}", p.display()),
            Self::TooShort(len) => write!(
                f,
                "file is {len} bytes, smaller than the {} byte superblock area",
                SLOT_COUNT as usize * PAGE_SIZE
            ),
            Self::Superblock(e) => write!(f, "superblock error: {e}"),
        }
    }
}

impl std::error::Error for FileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Superblock(e) => Some(e),
            Self::AlreadyExists(_) | Self::TooShort(_) => None,
        }
    }
}

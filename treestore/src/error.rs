//! Errors surfaced by the public API.
//!
//! Each storage layer has its own error enum. They are folded into [`Error`]
//! at the boundary so callers can tell caller mistakes, I/O failures and
//! corruption apart.

use crate::config::ConfigError;
use crate::registry::CatalogError;
use crate::storage::btree::NodeError;
use crate::storage::file::FileError;
use crate::storage::page::PageError;
use crate::storage::superblock::SuperblockError;
use crate::storage::wal::WalError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by database and tree operations.
#[derive(Debug)]
pub enum Error {
    /// The path exists but does not hold a valid database.
    Open(String),
    /// Reading, writing or syncing the database file failed.
    Io(std::io::Error),
    /// Stored data failed a checksum or structural check.
    Corruption(String),
    /// The handle's tree was dropped.
    TreeDropped { name: Vec<u8> },
    /// The operation is not allowed, such as dropping the default tree.
    Unsupported(&'static str),
    /// A single mutation is larger than the whole log.
    RecordTooLarge { size: u64, capacity: u64 },
    /// A thread panicked while holding an internal lock.
    LockPoisoned,
    /// Invalid configuration.
    Config(ConfigError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(reason) => write!(f, "cannot open database: {reason}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Corruption(detail) => write!(f, "storage corruption: {detail}"),
            Self::TreeDropped { name } => {
                write!(f, "tree {:?} was dropped", String::from_utf8_lossy(name))
            }
            Self::Unsupported(what) => write!(f, "unsupported operation: {what}"),
            Self::RecordTooLarge { size, capacity } => write!(
                f,
                "mutation of {size} bytes does not fit in the {capacity} byte log"
            ),
            Self::LockPoisoned => write!(f, "internal lock poisoned"),
            Self::Config(e) => write!(f, "configuration error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<FileError> for Error {
    fn from(e: FileError) -> Self {
        match e {
            FileError::Io(io) => Self::Io(io),
            FileError::AlreadyExists(path) => Self::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("file already exists: {}", path.display()),
            )),
            FileError::TooShort(_) | FileError::Superblock(_) => Self::Open(e.to_string()),
        }
    }
}

impl From<SuperblockError> for Error {
    fn from(e: SuperblockError) -> Self {
        Self::Open(e.to_string())
    }
}

impl From<PageError> for Error {
    fn from(e: PageError) -> Self {
        Self::Corruption(e.to_string())
    }
}

impl From<NodeError> for Error {
    fn from(e: NodeError) -> Self {
        Self::Corruption(e.to_string())
    }
}

impl From<CatalogError> for Error {
    fn from(e: CatalogError) -> Self {
        Self::Corruption(e.to_string())
    }
}

impl From<WalError> for Error {
    fn from(e: WalError) -> Self {
        match e {
            WalError::File(file) => file.into(),
            WalError::RecordTooLarge { size, capacity } => Self::RecordTooLarge { size, capacity },
            WalError::CorruptRecord
            | WalError::InvalidRecordType(_)
            | WalError::ChecksumMismatch { .. }
            | WalError::MidLogCorruption { .. }
            | WalError::Full { .. } => Self::Corruption(e.to_string()),
        }
    }
}

/// Returned by `compare_and_swap` when the current value did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::disallowed_methods)]
pub struct CompareAndSwapError {
    /// The value found in the tree.
    pub current: Option<Vec<u8>>,
    /// The value that would have been written.
    pub proposed: Option<Vec<u8>>,
}

impl std::fmt::Display for CompareAndSwapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compare and swap conflict")
    }
}

impl std::error::Error for CompareAndSwapError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_errors_map_to_distinct_kinds() {
        let io = Error::from(FileError::Io(std::io::Error::other("disk gone")));
        assert!(matches!(io, Error::Io(_)));

        let open = Error::from(FileError::TooShort(3));
        assert!(matches!(open, Error::Open(_)));
    }

    #[test]
    fn test_wal_errors_map_to_distinct_kinds() {
        let large = Error::from(WalError::RecordTooLarge {
            size: 10,
            capacity: 5,
        });
        assert!(matches!(
            large,
            Error::RecordTooLarge {
                size: 10,
                capacity: 5
            }
        ));

        let corrupt = Error::from(WalError::MidLogCorruption { offset: 64 });
        assert!(matches!(corrupt, Error::Corruption(_)));
    }

    #[test]
    fn test_tree_dropped_display() {
        let error = Error::TreeDropped {
            name: b"users".to_vec(),
        };
        assert_eq!(error.to_string(), "tree \"users\" was dropped");
    }
}

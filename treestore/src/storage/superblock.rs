//! Superblock structure and serialization.
//!
//! The superblock is double-buffered: pages 0 and 1 each hold one slot. A
//! checkpoint writes the slot its generation selects, so the previous slot
//! stays intact if the write is torn. Open reads both and keeps the valid
//! slot with the highest generation.

// PAGE_SIZE is a compile-time constant that fits in u32.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{ByteReader, Extent, PAGE_SIZE, PageId};

/// Magic number identifying a treestore database file.
pub const MAGIC: [u8; 8] = *b"TREESTOR";

/// Current format version.
pub const FORMAT_VERSION: u32 = 1;

/// Number of superblock slots at the start of the file.
pub const SLOT_COUNT: u64 = 2;

/// Page size as u32 for storage in superblock.
const PAGE_SIZE_U32: u32 = PAGE_SIZE as u32;

/// Bytes covered by the slot checksum; the checksum follows them.
const ENCODED_LEN: usize = 76;

/// The superblock contains all metadata needed to find the rest of the file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Format version number.
    pub format_version: u32,
    /// Page size in bytes (should always be `PAGE_SIZE`).
    pub page_size: u32,
    /// Incremented by every checkpoint; selects the slot to write.
    pub generation: u64,
    /// Total number of pages in the file when this slot was written.
    pub total_page_count: u64,
    /// First page of the log region.
    pub log_start_page: PageId,
    /// Number of pages in the log region.
    pub log_page_count: u64,
    /// Records with an LSN below this are covered by the catalog.
    pub checkpoint_lsn: u64,
    /// Next transaction ID to assign.
    pub next_txn_id: u64,
    /// Catalog extent, `None` before the first checkpoint.
    pub catalog: Option<Extent>,
}

impl Superblock {
    /// Create a superblock for a fresh database whose log occupies
    /// `log_page_count` pages right after the two slots.
    #[must_use]
    pub const fn new(log_page_count: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            page_size: PAGE_SIZE_U32,
            generation: 0,
            total_page_count: SLOT_COUNT + log_page_count,
            log_start_page: SLOT_COUNT,
            log_page_count,
            checkpoint_lsn: 1,
            next_txn_id: 1,
            catalog: None,
        }
    }

    /// The slot page this superblock is written to.
    #[must_use]
    pub const fn slot(&self) -> PageId {
        self.generation % SLOT_COUNT
    }

    /// Byte offset of the log region.
    #[must_use]
    pub const fn log_offset(&self) -> u64 {
        self.log_start_page * PAGE_SIZE as u64
    }

    /// Capacity of the log region in bytes.
    #[must_use]
    pub const fn log_capacity(&self) -> u64 {
        self.log_page_count * PAGE_SIZE as u64
    }

    /// First page after the fixed regions.
    #[must_use]
    pub const fn data_start_page(&self) -> PageId {
        self.log_start_page + self.log_page_count
    }

    /// Encode into a full slot page, zero padded after the checksum.
    #[must_use]
    pub fn encode(&self) -> Box<[u8; PAGE_SIZE]> {
        let (catalog_page, catalog_pages) = self
            .catalog
            .map_or((0, 0), |extent| (extent.page, extent.pages));

        let mut fields = Vec::with_capacity(ENCODED_LEN + 4);
        fields.extend_from_slice(&MAGIC);
        fields.extend_from_slice(&self.format_version.to_le_bytes());
        fields.extend_from_slice(&self.page_size.to_le_bytes());
        for word in [
            self.generation,
            self.total_page_count,
            self.log_start_page,
            self.log_page_count,
            self.checkpoint_lsn,
            self.next_txn_id,
            catalog_page,
        ] {
            fields.extend_from_slice(&word.to_le_bytes());
        }
        fields.extend_from_slice(&catalog_pages.to_le_bytes());
        debug_assert_eq!(fields.len(), ENCODED_LEN);
        fields.extend_from_slice(&crc32fast::hash(&fields).to_le_bytes());

        let mut slot = Box::new([0u8; PAGE_SIZE]);
        slot[..fields.len()].copy_from_slice(&fields);
        slot
    }

    /// Decode a slot read from disk.
    pub fn decode(slot: &[u8]) -> Result<Self, SuperblockError> {
        let mut reader = ByteReader::new(slot);
        let magic: [u8; 8] = reader
            .read_slice(MAGIC.len())
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(SuperblockError::Truncated)?;
        if magic != MAGIC {
            return Err(SuperblockError::InvalidMagic(magic));
        }

        let (covered, trailer) = slot
            .split_at_checked(ENCODED_LEN)
            .ok_or(SuperblockError::Truncated)?;
        let stored = ByteReader::new(trailer)
            .read_u32()
            .ok_or(SuperblockError::Truncated)?;
        let computed = crc32fast::hash(covered);
        if stored != computed {
            return Err(SuperblockError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let format_version = reader.read_u32().ok_or(SuperblockError::Truncated)?;
        if format_version != FORMAT_VERSION {
            return Err(SuperblockError::UnsupportedVersion(format_version));
        }
        let page_size = reader.read_u32().ok_or(SuperblockError::Truncated)?;
        if page_size != PAGE_SIZE_U32 {
            return Err(SuperblockError::InvalidPageSize(page_size));
        }

        let mut words = [0u64; 7];
        for word in &mut words {
            *word = reader.read_u64().ok_or(SuperblockError::Truncated)?;
        }
        let [
            generation,
            total_page_count,
            log_start_page,
            log_page_count,
            checkpoint_lsn,
            next_txn_id,
            catalog_page,
        ] = words;
        let catalog_pages = reader.read_u32().ok_or(SuperblockError::Truncated)?;

        Ok(Self {
            format_version,
            page_size,
            generation,
            total_page_count,
            log_start_page,
            log_page_count,
            checkpoint_lsn,
            next_txn_id,
            catalog: (catalog_pages > 0).then(|| Extent::new(catalog_page, catalog_pages)),
        })
    }

    /// Pick the newest valid slot.
    ///
    /// When neither slot is valid the error from slot 0 is returned, since an
    /// invalid magic there means the file is not a database at all.
    pub fn newest(
        slot0: Result<Self, SuperblockError>,
        slot1: Result<Self, SuperblockError>,
    ) -> Result<Self, SuperblockError> {
        match (slot0, slot1) {
            (Ok(a), Ok(b)) => Ok(if b.generation > a.generation { b } else { a }),
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(e), Err(_)) => Err(e),
        }
    }
}

/// Errors that can occur when reading a superblock.
#[derive(Debug)]
pub enum SuperblockError {
    /// Invalid magic number.
    InvalidMagic([u8; 8]),
    /// Slot checksum does not match its contents.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Unsupported format version.
    UnsupportedVersion(u32),
    /// Invalid page size.
    InvalidPageSize(u32),
    /// Slot shorter than an encoded superblock.
    Truncated,
}

impl std::fmt::Display for SuperblockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMagic(magic) => {
                write!(
                    f,
                    "invalid magic number: {:?}",
                    String::from_utf8_lossy(magic)
                )
            }
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "superblock checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::UnsupportedVersion(v) => write!(f, "unsupported format version: {v}"),
            Self::InvalidPageSize(s) => write!(f, "invalid page size: {s}"),
            Self::Truncated => write!(f, "superblock slot is truncated"),
        }
    }
}

impl std::error::Error for SuperblockError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_superblock_roundtrip() {
        let mut sb = Superblock::new(128);
        sb.generation = 7;
        sb.total_page_count = 400;
        sb.checkpoint_lsn = 99;
        sb.next_txn_id = 42;
        sb.catalog = Some(Extent::new(300, 2));

        let slot = sb.encode();
        let restored = Superblock::decode(slot.as_slice()).expect("should parse");

        assert_eq!(restored, sb);
        assert_eq!(restored.slot(), 1);
        assert_eq!(restored.data_start_page(), 130);
    }

    #[test]
    fn test_superblock_invalid_magic() {
        let mut slot = Superblock::new(16).encode();
        slot[..8].copy_from_slice(b"BADMAGIC");

        let result = Superblock::decode(slot.as_slice());
        assert!(matches!(result, Err(SuperblockError::InvalidMagic(_))));
    }

    #[test]
    fn test_superblock_detects_torn_slot() {
        let mut slot = Superblock::new(16).encode();
        // Inside the next transaction ID field.
        slot[57] ^= 0x40;

        let result = Superblock::decode(slot.as_slice());
        assert!(matches!(
            result,
            Err(SuperblockError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_superblock_short_slot() {
        let slot = Superblock::new(16).encode();
        let result = Superblock::decode(&slot[..40]);
        assert!(matches!(result, Err(SuperblockError::Truncated)));
    }

    #[test]
    fn test_newest_prefers_higher_generation() {
        let mut older = Superblock::new(16);
        older.generation = 4;
        let mut newer = older;
        newer.generation = 5;

        let picked = Superblock::newest(Ok(older), Ok(newer)).expect("one valid slot");
        assert_eq!(picked.generation, 5);

        let picked = Superblock::newest(
            Ok(older),
            Err(SuperblockError::ChecksumMismatch {
                expected: 0,
                actual: 1,
            }),
        )
        .expect("falls back to the intact slot");
        assert_eq!(picked.generation, 4);
    }
}

//! Page types and constants for the storage engine.
//!
//! The storage engine uses 8KB pages as the fundamental unit of I/O. Tree nodes
//! and the catalog are stored in *extents*: runs of contiguous pages whose first
//! bytes are an extent header.
//!
//! # Extent Layout
//!
//! ```text
//! +----------+--------------------------------------------------+
//! | 0        | page_type (1 byte)                               |
//! | 1        | flags (1 byte)                                   |
//! | 2-5      | CRC32 over header (checksum zeroed) + payload    |
//! | 6-7      | reserved                                         |
//! | 8-11     | payload_length (4 bytes)                         |
//! | 12-15    | page_count (4 bytes)                             |
//! | 16-N     | payload                                          |
//! +----------+--------------------------------------------------+
//! ```

// Extent sizes are bounded by u32 page counts.
#![allow(clippy::cast_possible_truncation)]

/// Page size in bytes (8KB).
pub const PAGE_SIZE: usize = 8192;

/// Page size as u64 for offset calculations.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// A page identifier (0-indexed page number).
pub type PageId = u64;

/// Size of the header at the start of every extent.
pub const EXTENT_HEADER_SIZE: usize = 16;

/// Payload bytes that fit in a single-page extent.
pub const EXTENT_USABLE_SPACE: usize = PAGE_SIZE - EXTENT_HEADER_SIZE;

/// What an extent holds, stored in its first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    /// B-tree internal node
    BTreeInternal = 0x03,
    /// B-tree leaf node
    BTreeLeaf = 0x04,
    /// Tree catalog written at each checkpoint
    Catalog = 0x08,
}

impl TryFrom<u8> for PageType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x03 => Ok(Self::BTreeInternal),
            0x04 => Ok(Self::BTreeLeaf),
            0x08 => Ok(Self::Catalog),
            _ => Err(value),
        }
    }
}

/// Decoded extent header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct ExtentHeader {
    page_type: PageType,
    checksum: u32,
    payload_len: usize,
    page_count: u32,
}

impl ExtentHeader {
    fn parse(bytes: &[u8]) -> Result<Self, PageError> {
        let mut reader = ByteReader::new(bytes);
        let type_byte = reader
            .read_slice(2)
            .map(|prefix| prefix[0])
            .ok_or(PageError::Truncated)?;
        let page_type = PageType::try_from(type_byte).map_err(PageError::InvalidPageType)?;
        let checksum = reader.read_u32().ok_or(PageError::Truncated)?;
        reader.read_slice(2).ok_or(PageError::Truncated)?;
        let payload_len = reader.read_u32().ok_or(PageError::Truncated)? as usize;
        let page_count = reader.read_u32().ok_or(PageError::Truncated)?;

        Ok(Self {
            page_type,
            checksum,
            payload_len,
            page_count,
        })
    }
}

/// A run of contiguous pages holding one serialized object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    /// First page of the run.
    pub page: PageId,
    /// Number of pages in the run (always at least 1).
    pub pages: u32,
}

impl Extent {
    #[must_use]
    pub const fn new(page: PageId, pages: u32) -> Self {
        Self { page, pages }
    }

    /// Byte offset of the extent in the database file.
    #[must_use]
    pub const fn byte_offset(self) -> u64 {
        self.page * PAGE_SIZE_U64
    }

    /// Length of the extent in bytes.
    #[must_use]
    pub const fn byte_len(self) -> usize {
        self.pages as usize * PAGE_SIZE
    }

    /// One past the last page of the extent.
    #[must_use]
    pub const fn end(self) -> PageId {
        self.page + self.pages as u64
    }
}

/// Number of pages needed to store `payload_len` bytes as an extent.
#[must_use]
pub const fn pages_for_payload(payload_len: usize) -> u32 {
    (payload_len + EXTENT_HEADER_SIZE).div_ceil(PAGE_SIZE) as u32
}

/// Checksum of an extent: the header with its checksum field zeroed, then the payload.
fn extent_checksum(header: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[0..2]); // page_type + flags
    hasher.update(&[0u8; 4]); // zero out checksum field
    hasher.update(&header[6..EXTENT_HEADER_SIZE]);
    hasher.update(payload);
    hasher.finalize()
}

/// Serialize `payload` into a page-aligned extent buffer.
#[must_use]
pub fn encode_extent(page_type: PageType, payload: &[u8]) -> Vec<u8> {
    let pages = pages_for_payload(payload.len());
    let mut buf = vec![0u8; pages as usize * PAGE_SIZE];

    buf[0] = page_type as u8;
    buf[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    buf[12..16].copy_from_slice(&pages.to_le_bytes());
    buf[EXTENT_HEADER_SIZE..EXTENT_HEADER_SIZE + payload.len()].copy_from_slice(payload);

    let checksum = extent_checksum(&buf[..EXTENT_HEADER_SIZE], payload);
    buf[2..6].copy_from_slice(&checksum.to_le_bytes());
    buf
}

/// Validate an extent buffer read from `extent` and return its type and payload.
pub fn decode_extent(extent: Extent, bytes: &[u8]) -> Result<(PageType, &[u8]), PageError> {
    let header = ExtentHeader::parse(bytes)?;
    let payload = bytes
        .get(EXTENT_HEADER_SIZE..EXTENT_HEADER_SIZE + header.payload_len)
        .filter(|_| header.page_count == extent.pages)
        .ok_or(PageError::LengthMismatch {
            page: extent.page,
            expected_pages: extent.pages,
            actual_pages: header.page_count,
        })?;

    let actual = extent_checksum(&bytes[..EXTENT_HEADER_SIZE], payload);
    if actual != header.checksum {
        return Err(PageError::ChecksumMismatch {
            expected: header.checksum,
            actual,
        });
    }

    Ok((header.page_type, payload))
}

/// Little-endian cursor over a serialized payload.
///
/// Every read returns `None` once the input is exhausted, so decoders can
/// turn truncation into their own error type with `ok_or`.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Bytes not yet consumed.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let slice = self.read_slice(4)?;
        Some(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let slice = self.read_slice(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(slice);
        Some(u64::from_le_bytes(buf))
    }

    /// Read a u32 length prefix followed by that many bytes.
    pub fn read_prefixed(&mut self) -> Option<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_slice(len)
    }
}

/// Append a u32 length prefix followed by `bytes`.
pub fn write_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

/// Errors related to page operations.
#[derive(Debug)]
pub enum PageError {
    /// Invalid page type byte.
    InvalidPageType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Extent header disagrees with the extent it was read from.
    LengthMismatch {
        page: PageId,
        expected_pages: u32,
        actual_pages: u32,
    },
    /// Buffer shorter than an extent header.
    Truncated,
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidPageType(v) => write!(f, "invalid page type: 0x{v:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::LengthMismatch {
                page,
                expected_pages,
                actual_pages,
            } => write!(
                f,
                "extent at page {page} spans {actual_pages} pages, expected {expected_pages}"
            ),
            Self::Truncated => write!(f, "truncated extent header"),
        }
    }
}

impl std::error::Error for PageError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_header_fields() {
        let buf = encode_extent(PageType::Catalog, b"abc");
        let header = ExtentHeader::parse(&buf).expect("should parse");

        assert_eq!(header.page_type, PageType::Catalog);
        assert_eq!(header.payload_len, 3);
        assert_eq!(header.page_count, 1);
        assert!(matches!(
            ExtentHeader::parse(&buf[..10]),
            Err(PageError::Truncated)
        ));
    }

    #[test]
    fn test_page_type_conversion() {
        assert_eq!(PageType::try_from(0x03), Ok(PageType::BTreeInternal));
        assert_eq!(PageType::try_from(0x04), Ok(PageType::BTreeLeaf));
        assert!(PageType::try_from(0xFF).is_err());
    }

    #[test]
    fn test_extent_spans_multiple_pages() {
        let payload = vec![7u8; PAGE_SIZE * 2];
        let buf = encode_extent(PageType::BTreeLeaf, &payload);
        assert_eq!(buf.len(), 3 * PAGE_SIZE);

        let extent = Extent::new(10, 3);
        let (page_type, decoded) = decode_extent(extent, &buf).expect("should decode");
        assert_eq!(page_type, PageType::BTreeLeaf);
        assert_eq!(decoded, payload.as_slice());
    }

    #[test]
    fn test_extent_detects_bit_flip() {
        let mut buf = encode_extent(PageType::Catalog, b"catalog bytes");
        buf[EXTENT_HEADER_SIZE + 3] ^= 0x01;

        let result = decode_extent(Extent::new(4, 1), &buf);
        assert!(matches!(result, Err(PageError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_extent_page_count_must_match() {
        let buf = encode_extent(PageType::BTreeLeaf, b"x");
        let result = decode_extent(Extent::new(4, 2), &buf);
        assert!(matches!(result, Err(PageError::LengthMismatch { .. })));
    }

    #[test]
    fn test_byte_reader_stops_at_end() {
        let mut buf = Vec::new();
        write_prefixed(&mut buf, b"abc");
        let mut reader = ByteReader::new(&buf);
        assert_eq!(reader.read_prefixed(), Some(&b"abc"[..]));
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.read_u32(), None);
    }
}

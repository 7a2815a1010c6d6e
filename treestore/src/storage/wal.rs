//! Write-Ahead Log (WAL) implementation.
//!
//! The WAL is the source of truth for every mutation made since the last
//! checkpoint. It lives in a fixed region of pages right after the superblock
//! slots and is written front to back. A checkpoint makes the log redundant
//! and resets the head to the start of the region.
//!
//! # Log Record Format
//!
//! Each record has the following layout:
//! ```text
//! +----------+--------------------------------------------------+
//! | 0-3      | record_length (4 bytes, includes header+payload) |
//! | 4        | record_type (1 byte)                             |
//! | 5-12     | transaction_id (8 bytes)                         |
//! | 13-20    | lsn (8 bytes) - Log Sequence Number              |
//! | 21-N     | payload (variable, depends on type)              |
//! | N-N+3    | CRC32 checksum (4 bytes)                         |
//! +----------+--------------------------------------------------+
//! ```
//!
//! # Groups
//!
//! Mutations are appended as `Begin, op..., Commit` groups in a single write.
//! Recovery applies a group only when its `Commit` is readable.
//!
//! Each `Begin` carries the superblock generation whose checkpoint started
//! the current log cycle. A log read against an older superblock slot is
//! then recognizable as written after a checkpoint that slot never saw.
//!
//! # Invariants
//!
//! - LSNs strictly increase across the life of the file, even across failed
//!   appends and log resets. Replay relies on this to tell live records from
//!   stale bytes left behind by earlier cycles.
//! - A checksum failure is a torn tail unless a live record of a later group
//!   follows it. The rest of the damaged record's own group may have reached
//!   the disk without it, since a group is one unsynced write.

// record_length fits in u32, capacity checks use u64
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::storage::file::{DatabaseFile, FileError};
use crate::storage::page::{ByteReader, PAGE_SIZE, write_prefixed};
use crate::storage::{Bytes, TreeId};

/// Default WAL capacity: 16MB
pub const DEFAULT_WAL_CAPACITY: u64 = 16 * 1024 * 1024;

/// Minimum WAL capacity: 1MB
pub const MIN_WAL_CAPACITY: u64 = 1024 * 1024;

/// Log record header size (before payload).
/// `record_length` (4) + `record_type` (1) + `txn_id` (8) + lsn (8) = 21 bytes
const RECORD_HEADER_SIZE: usize = 21;

/// CRC32 checksum size at end of record.
const CHECKSUM_SIZE: usize = 4;

/// Smallest possible record (Commit).
const MIN_RECORD_SIZE: usize = RECORD_HEADER_SIZE + CHECKSUM_SIZE;

/// Begin record: header, generation and checksum.
const BEGIN_RECORD_SIZE: usize = MIN_RECORD_SIZE + 8;

/// Log Sequence Number - monotonically increasing identifier for log records.
pub type Lsn = u64;

/// Transaction identifier shared by every record of a group.
pub type TxnId = u64;

/// Log record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    /// Group begin marker.
    Begin = 0x01,
    /// Key upsert.
    Insert = 0x02,
    /// Key tombstone.
    Remove = 0x03,
    /// Remove every key of a tree.
    Clear = 0x04,
    /// Group commit marker.
    Commit = 0x05,
    /// Register a tree name.
    CreateTree = 0x06,
    /// Drop a tree and its contents.
    DropTree = 0x07,
}

impl TryFrom<u8> for LogRecordType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Begin),
            0x02 => Ok(Self::Insert),
            0x03 => Ok(Self::Remove),
            0x04 => Ok(Self::Clear),
            0x05 => Ok(Self::Commit),
            0x06 => Ok(Self::CreateTree),
            0x07 => Ok(Self::DropTree),
            _ => Err(value),
        }
    }
}

/// Payload for different log record types.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::disallowed_methods)] // Clone shares the Arc'd key and value bytes
pub enum LogRecordPayload {
    /// Begin group, tagged with the generation of the current log cycle.
    Begin { generation: u64 },
    /// Insert or overwrite a key.
    Insert {
        tree_id: TreeId,
        key: Bytes,
        value: Bytes,
    },
    /// Remove a key.
    Remove { tree_id: TreeId, key: Bytes },
    /// Remove every key in a tree.
    Clear { tree_id: TreeId },
    /// Commit group - no additional data.
    Commit,
    /// Register `name` under `tree_id`.
    CreateTree { tree_id: TreeId, name: Bytes },
    /// Drop the tree with `tree_id`.
    DropTree { tree_id: TreeId },
}

impl LogRecordPayload {
    /// Get the record type for this payload.
    #[must_use]
    pub const fn record_type(&self) -> LogRecordType {
        match self {
            Self::Begin { .. } => LogRecordType::Begin,
            Self::Insert { .. } => LogRecordType::Insert,
            Self::Remove { .. } => LogRecordType::Remove,
            Self::Clear { .. } => LogRecordType::Clear,
            Self::Commit => LogRecordType::Commit,
            Self::CreateTree { .. } => LogRecordType::CreateTree,
            Self::DropTree { .. } => LogRecordType::DropTree,
        }
    }

    /// Calculate the serialized size of this payload.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        match self {
            Self::Commit => 0,
            Self::Begin { .. } => 8,
            Self::Insert { key, value, .. } => 8 + 4 + key.len() + 4 + value.len(),
            Self::Remove { key, .. } => 8 + 4 + key.len(),
            Self::CreateTree { name, .. } => 8 + 4 + name.len(),
            Self::Clear { .. } | Self::DropTree { .. } => 8,
        }
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Commit => {}
            Self::Begin { generation } => buf.extend_from_slice(&generation.to_le_bytes()),
            Self::Insert {
                tree_id,
                key,
                value,
            } => {
                buf.extend_from_slice(&tree_id.to_le_bytes());
                write_prefixed(buf, key);
                write_prefixed(buf, value);
            }
            Self::Remove { tree_id, key } => {
                buf.extend_from_slice(&tree_id.to_le_bytes());
                write_prefixed(buf, key);
            }
            Self::CreateTree { tree_id, name } => {
                buf.extend_from_slice(&tree_id.to_le_bytes());
                write_prefixed(buf, name);
            }
            Self::Clear { tree_id } | Self::DropTree { tree_id } => {
                buf.extend_from_slice(&tree_id.to_le_bytes());
            }
        }
    }

    /// Deserialize a payload from bytes.
    pub fn from_bytes(record_type: LogRecordType, bytes: &[u8]) -> Result<Self, WalError> {
        let mut reader = ByteReader::new(bytes);
        let payload = match record_type {
            LogRecordType::Begin => Self::Begin {
                generation: reader.read_u64().ok_or(WalError::CorruptRecord)?,
            },
            LogRecordType::Commit => Self::Commit,
            LogRecordType::Insert => {
                let tree_id = reader.read_u64().ok_or(WalError::CorruptRecord)?;
                let key = reader.read_prefixed().ok_or(WalError::CorruptRecord)?;
                let value = reader.read_prefixed().ok_or(WalError::CorruptRecord)?;
                Self::Insert {
                    tree_id,
                    key: Arc::from(key),
                    value: Arc::from(value),
                }
            }
            LogRecordType::Remove => {
                let tree_id = reader.read_u64().ok_or(WalError::CorruptRecord)?;
                let key = reader.read_prefixed().ok_or(WalError::CorruptRecord)?;
                Self::Remove {
                    tree_id,
                    key: Arc::from(key),
                }
            }
            LogRecordType::CreateTree => {
                let tree_id = reader.read_u64().ok_or(WalError::CorruptRecord)?;
                let name = reader.read_prefixed().ok_or(WalError::CorruptRecord)?;
                Self::CreateTree {
                    tree_id,
                    name: Arc::from(name),
                }
            }
            LogRecordType::Clear => Self::Clear {
                tree_id: reader.read_u64().ok_or(WalError::CorruptRecord)?,
            },
            LogRecordType::DropTree => Self::DropTree {
                tree_id: reader.read_u64().ok_or(WalError::CorruptRecord)?,
            },
        };

        if reader.remaining() != 0 {
            return Err(WalError::CorruptRecord);
        }
        Ok(payload)
    }
}

/// A complete log record.
#[derive(Debug, PartialEq, Eq)]
pub struct LogRecord {
    /// Transaction ID of the group this record belongs to.
    pub txn_id: TxnId,
    /// Log Sequence Number.
    pub lsn: Lsn,
    /// The record payload.
    pub payload: LogRecordPayload,
}

impl LogRecord {
    /// Create a new log record.
    #[cfg(test)]
    #[must_use]
    pub const fn new(txn_id: TxnId, lsn: Lsn, payload: LogRecordPayload) -> Self {
        Self {
            txn_id,
            lsn,
            payload,
        }
    }

    /// Calculate the total serialized size of this record.
    #[cfg(test)]
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        record_size(&self.payload)
    }

    /// Serialize this record to bytes.
    #[cfg(test)]
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        encode_record(&mut bytes, self.txn_id, self.lsn, &self.payload);
        bytes
    }

    /// Deserialize a record from bytes.
    ///
    /// Returns the record and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), WalError> {
        if bytes.len() < MIN_RECORD_SIZE {
            return Err(WalError::CorruptRecord);
        }

        // Read record length
        let record_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;

        if record_len < MIN_RECORD_SIZE || record_len > bytes.len() {
            return Err(WalError::CorruptRecord);
        }

        // Verify checksum
        let stored_checksum = u32::from_le_bytes([
            bytes[record_len - 4],
            bytes[record_len - 3],
            bytes[record_len - 2],
            bytes[record_len - 1],
        ]);
        let computed_checksum = crc32fast::hash(&bytes[..record_len - 4]);
        if stored_checksum != computed_checksum {
            return Err(WalError::ChecksumMismatch {
                expected: stored_checksum,
                actual: computed_checksum,
            });
        }

        // Parse header
        let record_type = LogRecordType::try_from(bytes[4]).map_err(WalError::InvalidRecordType)?;

        let txn_id = u64::from_le_bytes([
            bytes[5], bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12],
        ]);

        let lsn = u64::from_le_bytes([
            bytes[13], bytes[14], bytes[15], bytes[16], bytes[17], bytes[18], bytes[19], bytes[20],
        ]);

        // Parse payload
        let payload_bytes = &bytes[RECORD_HEADER_SIZE..record_len - CHECKSUM_SIZE];
        let payload = LogRecordPayload::from_bytes(record_type, payload_bytes)?;

        Ok((
            Self {
                txn_id,
                lsn,
                payload,
            },
            record_len,
        ))
    }
}

fn record_size(payload: &LogRecordPayload) -> usize {
    RECORD_HEADER_SIZE + payload.serialized_size() + CHECKSUM_SIZE
}

fn encode_record(buf: &mut Vec<u8>, txn_id: TxnId, lsn: Lsn, payload: &LogRecordPayload) {
    let start = buf.len();
    let total_len = record_size(payload);

    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(payload.record_type() as u8);
    buf.extend_from_slice(&txn_id.to_le_bytes());
    buf.extend_from_slice(&lsn.to_le_bytes());
    payload.write_to(buf);

    // CRC32 checksum - computed over everything before it
    let checksum = crc32fast::hash(&buf[start..]);
    buf.extend_from_slice(&checksum.to_le_bytes());
}

/// Write-Ahead Log manager.
///
/// Tracks the write position inside the log region. The file itself is shared
/// and passed to each call.
#[derive(Debug)]
pub struct Wal {
    /// Start offset of the WAL region in the file.
    region_start: u64,
    /// Capacity of the WAL region in bytes.
    capacity: u64,
    /// Current write position (offset from `region_start`).
    head: u64,
    /// Next LSN to assign.
    next_lsn: Lsn,
    /// Bytes appended since the last flush.
    unflushed: u64,
    /// Superblock generation that started the current cycle.
    generation: u64,
}

impl Wal {
    /// Create a WAL manager positioned at the front of its region.
    ///
    /// # Arguments
    /// - `region_start`: Byte offset where the WAL region begins
    /// - `capacity`: Total capacity of the WAL region in bytes
    /// - `next_lsn`: Next LSN to assign
    /// - `generation`: Superblock generation the log cycle belongs to
    #[must_use]
    pub const fn new(region_start: u64, capacity: u64, next_lsn: Lsn, generation: u64) -> Self {
        Self {
            region_start,
            capacity,
            head: 0,
            next_lsn,
            unflushed: 0,
            generation,
        }
    }

    /// Get the current head position (relative to `region_start`).
    #[must_use]
    pub const fn head(&self) -> u64 {
        self.head
    }

    /// Get the next LSN that will be assigned.
    #[must_use]
    pub const fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Byte offset of the log region in the file.
    #[cfg(test)]
    #[must_use]
    pub const fn region_start(&self) -> u64 {
        self.region_start
    }

    /// Calculate the free space in the log.
    #[must_use]
    pub const fn free_space(&self) -> u64 {
        self.capacity - self.head
    }

    /// Size in bytes of a group wrapping `ops` in Begin/Commit markers.
    #[must_use]
    pub fn group_size(ops: &[LogRecordPayload]) -> u64 {
        let body: usize = ops.iter().map(record_size).sum();
        (BEGIN_RECORD_SIZE + body + MIN_RECORD_SIZE) as u64
    }

    /// Append `ops` as one `Begin, op..., Commit` group.
    ///
    /// Returns the LSN of the commit record. The group is visible to replay
    /// once this returns; it is durable after the next [`Wal::flush`].
    ///
    /// # Pre-conditions
    ///
    /// - The group fits in [`Wal::free_space`]; callers checkpoint first otherwise.
    ///
    /// # Post-conditions
    ///
    /// - On failure the head is unchanged and the LSNs of the group are burned.
    pub fn append_group(
        &mut self,
        file: &DatabaseFile,
        txn_id: TxnId,
        ops: &[LogRecordPayload],
    ) -> Result<Lsn, WalError> {
        let size = Self::group_size(ops);
        if size > self.capacity {
            return Err(WalError::RecordTooLarge {
                size,
                capacity: self.capacity,
            });
        }
        if size > self.free_space() {
            return Err(WalError::Full {
                needed: size,
                free: self.free_space(),
            });
        }

        let mut buf = Vec::with_capacity(size as usize);
        let mut lsn = self.next_lsn;
        let begin = LogRecordPayload::Begin {
            generation: self.generation,
        };
        encode_record(&mut buf, txn_id, lsn, &begin);
        for op in ops {
            lsn += 1;
            encode_record(&mut buf, txn_id, lsn, op);
        }
        lsn += 1;
        encode_record(&mut buf, txn_id, lsn, &LogRecordPayload::Commit);
        self.next_lsn = lsn + 1;

        let offset = self.region_start + self.head;
        if let Err(e) = file.write_at(&buf, offset) {
            // Part of the group may have reached the disk. Zeroing its first
            // length word makes replay stop before it.
            if let Err(zero_err) = file.write_at(&[0u8; 4], offset) {
                tracing::warn!(error = %zero_err, offset, "failed to invalidate partial log group");
            }
            return Err(WalError::File(e));
        }

        self.head += size;
        self.unflushed += size;
        Ok(lsn)
    }

    /// Sync the WAL to disk.
    ///
    /// Returns the number of bytes made durable by this call.
    pub fn flush(&mut self, file: &DatabaseFile) -> Result<u64, WalError> {
        if self.unflushed == 0 {
            return Ok(0);
        }
        file.sync_data()?;
        Ok(std::mem::take(&mut self.unflushed))
    }

    /// Start a new cycle at the front of the region for the checkpoint with
    /// `generation`.
    ///
    /// Only valid once a checkpoint covering every record is durable.
    pub const fn reset(&mut self, generation: u64) {
        self.head = 0;
        self.unflushed = 0;
        self.generation = generation;
    }

    /// Position the log after recovery.
    pub fn resume(&mut self, head: u64, next_lsn: Lsn) {
        self.head = head.min(self.capacity);
        self.next_lsn = self.next_lsn.max(next_lsn);
    }

    /// Lazily read live records from the start of the region.
    ///
    /// Records with an LSN below `from_lsn` belong to an earlier cycle and end
    /// the scan, as does the first record whose LSN does not increase.
    #[must_use]
    pub const fn replay<'a>(&self, file: &'a DatabaseFile, from_lsn: Lsn) -> WalReplay<'a> {
        WalReplay {
            file,
            region_start: self.region_start,
            capacity: self.capacity,
            offset: 0,
            from_lsn,
            last_lsn: None,
            open_txn: None,
            done: false,
        }
    }
}

/// Outcome of reading one record slot during replay.
enum Slot {
    /// No plausible record starts here.
    End,
    /// A valid record and its length.
    Record(LogRecord, u64),
    /// A plausible length whose bytes fail validation.
    Damaged(u64),
}

/// Iterator over live log records.
///
/// Yields each record with the offset just past it. Stops silently at a torn
/// tail and yields [`WalError::MidLogCorruption`] when a damaged record is
/// followed by a live record of a later group.
pub struct WalReplay<'a> {
    file: &'a DatabaseFile,
    region_start: u64,
    capacity: u64,
    offset: u64,
    from_lsn: Lsn,
    last_lsn: Option<Lsn>,
    /// Transaction of the last yielded record unless it was a `Commit`.
    open_txn: Option<TxnId>,
    done: bool,
}

impl WalReplay<'_> {
    fn read_slot(&self, offset: u64) -> Result<Slot, WalError> {
        if offset + MIN_RECORD_SIZE as u64 > self.capacity {
            return Ok(Slot::End);
        }

        let mut len_bytes = [0u8; 4];
        self.file.read_at(&mut len_bytes, self.region_start + offset)?;
        let record_len = u64::from(u32::from_le_bytes(len_bytes));
        if record_len < MIN_RECORD_SIZE as u64 || offset + record_len > self.capacity {
            return Ok(Slot::End);
        }

        let mut buf = vec![0u8; record_len as usize];
        self.file.read_at(&mut buf, self.region_start + offset)?;
        match LogRecord::from_bytes(&buf) {
            Ok((record, _)) => Ok(Slot::Record(record, record_len)),
            Err(
                WalError::ChecksumMismatch { .. }
                | WalError::CorruptRecord
                | WalError::InvalidRecordType(_),
            ) => Ok(Slot::Damaged(record_len)),
            Err(e) => Err(e),
        }
    }

    fn is_live(&self, record: &LogRecord, last_lsn: Option<Lsn>) -> bool {
        record.lsn >= self.from_lsn && last_lsn.is_none_or(|last| record.lsn > last)
    }

    /// Whether a live record of a later group follows the damaged record
    /// ending at `offset`.
    ///
    /// Records of the damaged record's own group are skipped.
    fn later_group_follows(&self, mut offset: u64) -> Result<bool, WalError> {
        let mut group = self.open_txn;
        let mut last_lsn = self.last_lsn;
        loop {
            let Slot::Record(next, len) = self.read_slot(offset)? else {
                return Ok(false);
            };
            if !self.is_live(&next, last_lsn) {
                return Ok(false);
            }
            let same_group = match group {
                Some(txn) => next.txn_id == txn,
                // The damaged record was a Begin unless a new group starts here.
                None => next.payload.record_type() != LogRecordType::Begin,
            };
            if !same_group {
                return Ok(true);
            }
            group = Some(next.txn_id);
            last_lsn = Some(next.lsn);
            offset += len;
        }
    }
}

impl Iterator for WalReplay<'_> {
    type Item = Result<(LogRecord, u64), WalError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_slot(self.offset) {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(Slot::End) => {
                self.done = true;
                None
            }
            Ok(Slot::Record(record, len)) => {
                if !self.is_live(&record, self.last_lsn) {
                    self.done = true;
                    return None;
                }
                self.offset += len;
                self.last_lsn = Some(record.lsn);
                self.open_txn = (record.payload.record_type() != LogRecordType::Commit)
                    .then_some(record.txn_id);
                Some(Ok((record, self.offset)))
            }
            Ok(Slot::Damaged(len)) => {
                self.done = true;
                match self.later_group_follows(self.offset + len) {
                    Ok(false) => None,
                    Ok(true) => Some(Err(WalError::MidLogCorruption {
                        offset: self.offset,
                    })),
                    Err(e) => Some(Err(e)),
                }
            }
        }
    }
}

/// Errors that can occur during WAL operations.
#[derive(Debug)]
pub enum WalError {
    /// Corrupt log record.
    CorruptRecord,
    /// Invalid record type byte.
    InvalidRecordType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Damaged record followed by live records.
    MidLogCorruption { offset: u64 },
    /// Group too large for WAL capacity.
    RecordTooLarge { size: u64, capacity: u64 },
    /// Group does not fit in the remaining space.
    Full { needed: u64, free: u64 },
    /// File error.
    File(FileError),
}

impl std::fmt::Display for WalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CorruptRecord => write!(f, "corrupt WAL record"),
            Self::InvalidRecordType(t) => write!(f, "invalid WAL record type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(
                    f,
                    "WAL checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
                )
            }
            Self::MidLogCorruption { offset } => {
                write!(f, "damaged WAL record at offset {offset} precedes live records")
            }
            Self::RecordTooLarge { size, capacity } => {
                write!(
                    f,
                    "WAL group too large: {size} bytes exceeds capacity of {capacity} bytes"
                )
            }
            Self::Full { needed, free } => {
                write!(f, "WAL full: need {needed} bytes, {free} free")
            }
            Self::File(e) => write!(f, "WAL file error: {e}"),
        }
    }
}

impl std::error::Error for WalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::File(e) => Some(e),
            _ => None,
        }
    }
}

impl From<FileError> for WalError {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

/// Calculate the number of pages needed for a given WAL capacity.
#[must_use]
pub const fn pages_for_capacity(capacity: u64) -> u64 {
    let capacity = if capacity < MIN_WAL_CAPACITY {
        MIN_WAL_CAPACITY
    } else {
        capacity
    };
    capacity.div_ceil(PAGE_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::superblock::Superblock;
    use tempfile::{TempDir, tempdir};

    fn test_file() -> (TempDir, DatabaseFile, Wal) {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let (file, sb) = DatabaseFile::create(&path, MIN_WAL_CAPACITY).expect("create db");
        let wal = wal_for(&sb);
        (dir, file, wal)
    }

    fn wal_for(sb: &Superblock) -> Wal {
        Wal::new(
            sb.log_offset(),
            sb.log_capacity(),
            sb.checkpoint_lsn,
            sb.generation,
        )
    }

    fn insert(key: &[u8], value: &[u8]) -> LogRecordPayload {
        LogRecordPayload::Insert {
            tree_id: 0,
            key: Arc::from(key),
            value: Arc::from(value),
        }
    }

    fn replay_all(wal: &Wal, file: &DatabaseFile, from: Lsn) -> Vec<LogRecord> {
        wal.replay(file, from)
            .map(|item| item.expect("replay should succeed").0)
            .collect()
    }

    #[test]
    fn test_log_record_roundtrip_insert() {
        let record = LogRecord::new(10, 300, insert(b"alice", b"10"));

        let bytes = record.to_bytes();
        let (decoded, consumed) = LogRecord::from_bytes(&bytes).expect("should decode");

        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_log_record_roundtrip_create_tree() {
        let record = LogRecord::new(
            3,
            7,
            LogRecordPayload::CreateTree {
                tree_id: 5,
                name: Arc::from(&b"users"[..]),
            },
        );

        let (decoded, _) = LogRecord::from_bytes(&record.to_bytes()).expect("should decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_checksum_validation() {
        let record = LogRecord::new(1, 1, LogRecordPayload::Remove {
            tree_id: 2,
            key: Arc::from(&b"bob"[..]),
        });
        let mut bytes = record.to_bytes();
        bytes[RECORD_HEADER_SIZE + 2] ^= 0xFF;

        let result = LogRecord::from_bytes(&bytes);
        assert!(matches!(result, Err(WalError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_payload_serialized_size() {
        let payload = insert(b"key", b"value");
        let record = LogRecord::new(1, 1, payload.clone());
        assert_eq!(record.to_bytes().len(), record.serialized_size());
        assert_eq!(
            Wal::group_size(&[payload]),
            (BEGIN_RECORD_SIZE + record.serialized_size() + MIN_RECORD_SIZE) as u64
        );
    }

    #[test]
    fn test_append_group_and_replay() {
        let (_dir, file, mut wal) = test_file();

        let commit = wal
            .append_group(&file, 1, &[insert(b"a", b"1"), insert(b"b", b"2")])
            .expect("append");
        assert_eq!(commit, 4);
        assert_eq!(wal.next_lsn(), 5);

        let records = replay_all(&wal, &file, 1);
        let types: Vec<_> = records.iter().map(|r| r.payload.record_type()).collect();
        assert_eq!(
            types,
            vec![
                LogRecordType::Begin,
                LogRecordType::Insert,
                LogRecordType::Insert,
                LogRecordType::Commit
            ]
        );
        assert!(records.iter().all(|r| r.txn_id == 1));
    }

    #[test]
    fn test_replay_ignores_records_before_checkpoint() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[insert(b"old", b"1")])
            .expect("append");

        // Simulate a checkpoint: the log restarts at the front with higher LSNs.
        let checkpoint_lsn = wal.next_lsn();
        wal.reset(1);
        assert!(replay_all(&wal, &file, checkpoint_lsn).is_empty());

        wal.append_group(&file, 2, &[]).expect("append");
        let records = replay_all(&wal, &file, checkpoint_lsn);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lsn, checkpoint_lsn);
    }

    #[test]
    fn test_torn_tail_is_silently_dropped() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[insert(b"a", b"1")])
            .expect("append");
        let tail_start = wal.head();
        wal.append_group(&file, 2, &[insert(b"b", b"2")])
            .expect("append");

        // Flip a byte inside the last group's Commit record.
        let insert_len = record_size(&insert(b"b", b"2")) as u64;
        let offset =
            wal.region_start() + tail_start + BEGIN_RECORD_SIZE as u64 + insert_len + 8;
        file.write_at(&[0xEE], offset).expect("corrupt");

        let records = replay_all(&wal, &file, 1);
        assert_eq!(records.len(), 5, "first group plus the uncommitted records");
        assert_eq!(records[4].payload.record_type(), LogRecordType::Insert);
        assert_eq!(records[4].txn_id, 2);
    }

    #[test]
    fn test_mid_log_corruption_is_reported() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[insert(b"a", b"1")])
            .expect("append");
        wal.append_group(&file, 2, &[insert(b"b", b"2")])
            .expect("append");

        // Damage the first Insert; live records follow it.
        let offset = wal.region_start() + BEGIN_RECORD_SIZE as u64 + 8;
        file.write_at(&[0xEE], offset).expect("corrupt");

        let results: Vec<_> = wal.replay(&file, 1).collect();
        assert!(matches!(
            results.last(),
            Some(Err(WalError::MidLogCorruption { .. }))
        ));
    }

    #[test]
    fn test_damage_inside_last_group_is_torn_tail() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[insert(b"a", b"1")])
            .expect("append");
        let tail_start = wal.head();
        // Spans several pages; the Commit after it stays intact.
        wal.append_group(&file, 2, &[insert(b"big", &[7u8; 20_000])])
            .expect("append");

        let offset = wal.region_start() + tail_start + BEGIN_RECORD_SIZE as u64 + 10_000;
        file.write_at(&[0xEE], offset).expect("corrupt");

        let results: Vec<_> = wal.replay(&file, 1).collect();
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(results.len(), 4, "first group plus the second Begin");
    }

    #[test]
    fn test_damaged_begin_of_last_group_is_torn_tail() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[insert(b"a", b"1")])
            .expect("append");
        let tail_start = wal.head();
        wal.append_group(&file, 2, &[insert(b"b", b"2"), insert(b"c", b"3")])
            .expect("append");

        file.write_at(&[0xEE], wal.region_start() + tail_start + 22)
            .expect("corrupt");

        let records = replay_all(&wal, &file, 1);
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.txn_id == 1));
    }

    #[test]
    fn test_begin_records_carry_generation() {
        let (_dir, file, mut wal) = test_file();
        wal.append_group(&file, 1, &[]).expect("append");
        let checkpoint_lsn = wal.next_lsn();
        wal.reset(5);
        wal.append_group(&file, 2, &[]).expect("append");

        let records = replay_all(&wal, &file, checkpoint_lsn);
        assert_eq!(records[0].payload, LogRecordPayload::Begin { generation: 5 });
    }

    #[test]
    fn test_failed_append_burns_lsns_and_keeps_head() {
        let (_dir, file, mut wal) = test_file();
        file.faults().tear_next_write(30);

        let result = wal.append_group(&file, 1, &[insert(b"a", b"1")]);
        assert!(matches!(result, Err(WalError::File(_))));
        assert_eq!(wal.head(), 0);
        assert_eq!(wal.next_lsn(), 4);
        assert!(replay_all(&wal, &file, 1).is_empty());

        wal.append_group(&file, 2, &[]).expect("append");
        let records = replay_all(&wal, &file, 1);
        assert_eq!(records[0].lsn, 4);
    }

    #[test]
    fn test_group_too_large_and_full() {
        let (_dir, file, mut wal) = test_file();

        let huge = insert(b"k", &vec![0u8; MIN_WAL_CAPACITY as usize]);
        assert!(matches!(
            wal.append_group(&file, 1, &[huge]),
            Err(WalError::RecordTooLarge { .. })
        ));

        let half = insert(b"k", &vec![0u8; (MIN_WAL_CAPACITY / 2) as usize]);
        wal.append_group(&file, 2, std::slice::from_ref(&half))
            .expect("first half fits");
        assert!(matches!(
            wal.append_group(&file, 3, &[half]),
            Err(WalError::Full { .. })
        ));
    }

    #[test]
    fn test_flush_reports_bytes() {
        let (_dir, file, mut wal) = test_file();
        assert_eq!(wal.flush(&file).expect("flush"), 0);

        wal.append_group(&file, 1, &[]).expect("append");
        assert_eq!(
            wal.flush(&file).expect("flush"),
            (BEGIN_RECORD_SIZE + MIN_RECORD_SIZE) as u64
        );
        assert_eq!(wal.flush(&file).expect("flush"), 0);
    }

    #[test]
    fn test_pages_for_capacity() {
        assert_eq!(pages_for_capacity(0), MIN_WAL_CAPACITY / PAGE_SIZE as u64);
        assert_eq!(
            pages_for_capacity(MIN_WAL_CAPACITY + 1),
            MIN_WAL_CAPACITY / PAGE_SIZE as u64 + 1
        );
    }
}

//! Common helpers for end-to-end tests.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::Tree;
use crate::storage::Bytes;
use crate::storage::page::PAGE_SIZE_U64;
use crate::storage::wal::{LogRecordPayload, Wal};

/// Byte offset of the log region: it follows the two superblock slots.
pub const LOG_START: u64 = 2 * PAGE_SIZE_U64;

/// Every entry of `tree`, in iteration order.
pub fn entries(tree: &Tree) -> Vec<(Vec<u8>, Vec<u8>)> {
    tree.iter()
        .expect("iter")
        .map(|entry| entry.expect("entry"))
        .collect()
}

/// Encoded size of the log group written by one `insert` on tree `tree_id`.
pub fn insert_group_size(tree_id: u64, key: &[u8], value: &[u8]) -> u64 {
    Wal::group_size(&[LogRecordPayload::Insert {
        tree_id,
        key: Bytes::from(key),
        value: Bytes::from(value),
    }])
}

/// Flip every bit of the byte at `offset`.
pub fn flip_byte(path: &Path, offset: u64) {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open database file");
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.read_exact(&mut byte).expect("read");
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(&byte).expect("write");
    file.sync_all().expect("sync");
}

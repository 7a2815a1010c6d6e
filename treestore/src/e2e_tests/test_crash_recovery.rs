//! Damaged log contents found on reopen.

use crate::e2e_tests::helpers::*;
use crate::testing::test_config;
use crate::{Db, Error};

/// Write two single-insert groups to the log of a fresh database and close
/// it without checkpointing.
fn two_groups(path: &std::path::Path) {
    let db = Db::open(path, test_config()).expect("open");
    db.insert(b"a", b"1").expect("insert");
    db.insert(b"b", b"2").expect("insert");
    drop(db);
}

#[test]
fn test_torn_tail_is_discarded() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");
    two_groups(&path);

    // The last byte of the second group is its commit checksum.
    let first = insert_group_size(0, b"a", b"1");
    let second = insert_group_size(0, b"b", b"2");
    flip_byte(&path, LOG_START + first + second - 1);

    let db = Db::open(&path, test_config()).expect("reopen");
    assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert!(db.get(b"b").expect("get").is_none());
    assert_eq!(db.len().expect("len"), 1);

    // New groups overwrite the torn tail.
    db.insert(b"c", b"3").expect("insert");
    drop(db);
    let db = Db::open(&path, test_config()).expect("reopen");
    assert_eq!(db.len().expect("len"), 2);
    assert_eq!(db.get(b"c").expect("get"), Some(b"3".to_vec()));
}

#[test]
fn test_mid_log_corruption_is_reported() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");
    two_groups(&path);

    // Inside the insert record of the first group, after the 33 byte Begin
    // record and the 21 byte record header.
    flip_byte(&path, LOG_START + 33 + 22);

    let result = Db::open(&path, test_config());
    assert!(matches!(result, Err(Error::Corruption(_))));
}

#[test]
fn test_damage_inside_last_group_is_torn_tail() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");

    let db = Db::open(&path, test_config()).expect("open");
    db.insert(b"a", b"1").expect("insert");
    db.insert(b"big", vec![7u8; 20_000]).expect("insert");
    drop(db);

    // Deep inside the large insert record; its commit record is intact.
    let first = insert_group_size(0, b"a", b"1");
    flip_byte(&path, LOG_START + first + 10_000);

    let db = Db::open(&path, test_config()).expect("reopen");
    assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
    assert!(db.get(b"big").expect("get").is_none());
    assert_eq!(db.len().expect("len"), 1);
}

#[test]
fn test_damaged_superblock_slot_falls_back() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");

    let db = Db::open(&path, test_config()).expect("open");
    db.insert(b"a", b"1").expect("insert");
    db.checkpoint().expect("checkpoint");
    drop(db);

    // Generation 2 lives in slot 0; slot 1 still holds generation 1.
    flip_byte(&path, 30);

    // Nothing was logged after the lost checkpoint, so generation 1's log
    // cycle is still in place and `a` replays from it.
    let db = Db::open(&path, test_config()).expect("reopen");
    assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
}

#[test]
fn test_damaged_superblock_slot_with_newer_log_fails_open() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");

    let db = Db::open(&path, test_config()).expect("open");
    db.insert(b"a", b"1").expect("insert");
    db.checkpoint().expect("checkpoint");
    db.insert(b"b", b"2").expect("insert");
    drop(db);

    // `a` only exists in generation 2's catalog, and `b` was logged after it.
    flip_byte(&path, 30);

    let result = Db::open(&path, test_config());
    assert!(matches!(result, Err(Error::Corruption(_))));
}

#[test]
fn test_both_superblocks_damaged_fails_open() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");
    drop(Db::open(&path, test_config()).expect("open"));

    flip_byte(&path, 30);
    flip_byte(&path, 8192 + 30);

    assert!(matches!(Db::open(&path, test_config()), Err(Error::Open(_))));
}

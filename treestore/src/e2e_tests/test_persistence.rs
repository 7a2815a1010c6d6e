//! Committed data survives closing and reopening the database.

use crate::e2e_tests::helpers::*;
use crate::testing::{TestDb, test_config};
use crate::{Batch, Db};

fn populate(db: &Db) {
    let users = db.open_tree(b"users").expect("open_tree");
    let orders = db.open_tree(b"orders").expect("open_tree");

    for i in 0..500u32 {
        users
            .insert(format!("user{i:04}"), format!("name{i}"))
            .expect("insert");
    }
    let batch: Batch = (0..200u32)
        .map(|i| (i.to_be_bytes(), vec![u8::try_from(i % 256).expect("fits"); 100]))
        .collect();
    orders.apply_batch(batch).expect("apply_batch");
    for i in (0..500u32).step_by(7) {
        users.remove(format!("user{i:04}")).expect("remove");
    }
}

#[test]
fn test_close_and_reopen_round_trips() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");

    let db = Db::open(&path, test_config()).expect("open");
    populate(&db);
    let users_before = entries(&db.open_tree(b"users").expect("open_tree"));
    let orders_sum = db.open_tree(b"orders").expect("open_tree").checksum().expect("checksum");
    db.close().expect("close");

    let db = Db::open(&path, test_config()).expect("reopen");
    assert!(db.was_recovered());
    let users = db.open_tree(b"users").expect("open_tree");
    let orders = db.open_tree(b"orders").expect("open_tree");

    assert_eq!(entries(&users), users_before);
    assert_eq!(users.len().expect("len"), users_before.len());
    assert_eq!(orders.len().expect("len"), 200);
    assert_eq!(orders.checksum().expect("checksum"), orders_sum);
    assert_eq!(users.get(b"user0001").expect("get"), Some(b"name1".to_vec()));
    assert!(users.get(b"user0007").expect("get").is_none());
}

#[test]
fn test_unclosed_database_replays_log() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("test.db");

    let db = Db::open(&path, test_config()).expect("open");
    populate(&db);
    let checksum = db.open_tree(b"users").expect("open_tree").checksum().expect("checksum");
    // Dropping flushes the log but does not checkpoint.
    drop(db);

    let db = Db::open(&path, test_config()).expect("reopen");
    let users = db.open_tree(b"users").expect("open_tree");
    assert_eq!(users.checksum().expect("checksum"), checksum);

    let mut names = db.tree_names().expect("tree_names");
    names.sort();
    assert!(names.contains(&b"orders".to_vec()));
    assert!(names.contains(&b"users".to_vec()));
    assert_eq!(names.len(), 3);
}

#[test]
fn test_flush_reports_synced_bytes() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = Db::open(dir.path().join("test.db"), test_config()).expect("open");

    db.insert(b"k", b"v").expect("insert");
    let expected = insert_group_size(0, b"k", b"v");
    assert_eq!(db.flush().expect("flush"), usize::try_from(expected).expect("fits"));
    assert_eq!(db.flush().expect("flush"), 0);
}

#[test]
fn test_size_on_disk_grows_with_data() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let db = Db::open(dir.path().join("test.db"), test_config()).expect("open");
    let empty = db.size_on_disk().expect("size_on_disk");

    for i in 0..200u32 {
        db.insert(i.to_be_bytes(), vec![0u8; 1000]).expect("insert");
    }
    db.checkpoint().expect("checkpoint");
    assert!(db.size_on_disk().expect("size_on_disk") > empty);
}

#[test]
fn test_background_flusher_syncs_the_log() {
    let config = test_config().flush_every_ms(Some(10));
    let db = TestDb::with_config(config);

    db.insert(b"k", b"v").expect("insert");
    std::thread::sleep(std::time::Duration::from_millis(300));

    assert_eq!(db.flush().expect("flush"), 0, "flusher already synced the log");
}

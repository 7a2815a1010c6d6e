//! The basic documented scenarios.

use crate::Batch;
use crate::e2e_tests::helpers::*;
use crate::testing::TestDb;

#[test]
fn test_iteration_order_and_drop() {
    let db = TestDb::new();
    let tree = db.open_tree(b"test").expect("open_tree");

    tree.insert(b"bob", b"20").expect("insert");
    tree.insert(b"alice", b"10").expect("insert");

    assert_eq!(
        entries(&tree),
        vec![
            (b"alice".to_vec(), b"10".to_vec()),
            (b"bob".to_vec(), b"20".to_vec()),
        ]
    );

    assert!(db.drop_tree(b"test").expect("drop_tree"));
    assert_eq!(tree.name(), b"test".to_vec());
    assert!(!db.drop_tree(b"test").expect("drop_tree again"));
}

#[test]
fn test_batch_into_empty_tree() {
    let db = TestDb::new();
    let tree = db.open_tree(b"people").expect("open_tree");

    let mut batch = Batch::default();
    batch.insert(b"alice", b"10");
    batch.insert(b"bob", b"20");
    batch.insert(b"carol", b"30");
    tree.apply_batch(batch).expect("apply_batch");

    assert_eq!(tree.get(b"alice").expect("get"), Some(b"10".to_vec()));
    assert_eq!(tree.get(b"bob").expect("get"), Some(b"20".to_vec()));
    assert_eq!(tree.get(b"carol").expect("get"), Some(b"30".to_vec()));
    assert_eq!(tree.len().expect("len"), 3);
}

#[test]
fn test_open_tree_is_idempotent() {
    let db = TestDb::new();
    let first = db.open_tree(b"shared").expect("open_tree");
    let second = db.open_tree(b"shared").expect("open_tree");

    first.insert(b"k", b"v").expect("insert");
    assert_eq!(second.get(b"k").expect("get"), Some(b"v".to_vec()));

    let names = db.tree_names().expect("tree_names");
    assert_eq!(names.iter().filter(|n| n.as_slice() == b"shared").count(), 1);
}

#[test]
fn test_trees_do_not_share_keys() {
    let db = TestDb::new();
    let a = db.open_tree(b"a").expect("open_tree");
    let b = db.open_tree(b"b").expect("open_tree");

    a.insert(b"key", b"from a").expect("insert");
    b.insert(b"key", b"from b").expect("insert");
    a.remove(b"key").expect("remove");

    assert!(a.get(b"key").expect("get").is_none());
    assert_eq!(b.get(b"key").expect("get"), Some(b"from b".to_vec()));
    assert!(db.get(b"key").expect("get").is_none());
}

#[test]
fn test_empty_keys_and_values() {
    let db = TestDb::new();
    db.insert(b"", b"empty key").expect("insert");
    db.insert(b"empty value", b"").expect("insert");

    assert_eq!(db.get(b"").expect("get"), Some(b"empty key".to_vec()));
    assert_eq!(db.get(b"empty value").expect("get"), Some(Vec::new()));

    let db = db.reopen();
    assert_eq!(entries(&db)[0].0, Vec::<u8>::new());
    assert_eq!(db.len().expect("len"), 2);
}

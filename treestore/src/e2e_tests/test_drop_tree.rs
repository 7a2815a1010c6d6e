//! Dropping trees and what happens to their handles and space.

use crate::e2e_tests::helpers::*;
use crate::testing::TestDb;
use crate::{Error, TreeState};

#[test]
fn test_drop_is_durable() {
    let db = TestDb::new();
    let tree = db.open_tree(b"temp").expect("open_tree");
    tree.insert(b"k", b"v").expect("insert");
    db.checkpoint().expect("checkpoint");
    assert!(db.drop_tree(b"temp").expect("drop_tree"));
    drop(tree);

    let db = db.reopen();
    assert_eq!(db.tree_names().expect("tree_names").len(), 1);
    let tree = db.open_tree(b"temp").expect("open_tree");
    assert!(tree.is_empty().expect("is_empty"));
}

#[test]
fn test_dropped_handle_is_not_revived() {
    let db = TestDb::new();
    let old = db.open_tree(b"t").expect("open_tree");
    old.insert(b"k", b"v").expect("insert");
    db.drop_tree(b"t").expect("drop_tree");

    let new = db.open_tree(b"t").expect("open_tree");
    new.insert(b"k", b"new").expect("insert");

    assert_eq!(old.state(), TreeState::Dropped);
    assert_eq!(new.state(), TreeState::Open);
    assert!(matches!(old.get(b"k"), Err(Error::TreeDropped { .. })));
    assert!(matches!(old.remove(b"k"), Err(Error::TreeDropped { .. })));
    assert!(matches!(old.clear(), Err(Error::TreeDropped { .. })));
    assert_eq!(entries(&new), vec![(b"k".to_vec(), b"new".to_vec())]);
}

#[test]
fn test_iterator_survives_drop() {
    let db = TestDb::new();
    let tree = db.open_tree(b"t").expect("open_tree");
    for i in 0..100u32 {
        tree.insert(i.to_be_bytes(), b"v").expect("insert");
    }
    db.checkpoint().expect("checkpoint");

    let iter = tree.iter().expect("iter");
    db.drop_tree(b"t").expect("drop_tree");
    db.checkpoint().expect("checkpoint");
    db.checkpoint().expect("checkpoint");

    assert_eq!(iter.count(), 100);
}

#[test]
fn test_dropped_tree_space_is_reused() {
    let db = TestDb::new();
    let value = vec![7u8; 500];

    let fill_and_drop = || {
        let tree = db.open_tree(b"bulk").expect("open_tree");
        for i in 0..400u32 {
            tree.insert(i.to_be_bytes(), &value).expect("insert");
        }
        db.checkpoint().expect("checkpoint");
        db.drop_tree(b"bulk").expect("drop_tree");
        // Retired extents become reusable two checkpoints later.
        for _ in 0..3 {
            db.checkpoint().expect("checkpoint");
        }
        db.size_on_disk().expect("size_on_disk")
    };

    let first = fill_and_drop();
    let second = fill_and_drop();
    assert!(
        second <= first + 64 * 8192,
        "file grew from {first} to {second} bytes"
    );
}

//! The default tree is reserved and always present.

use crate::testing::TestDb;
use crate::{DEFAULT_TREE_NAME, Error};

#[test]
fn test_default_tree_is_reachable_by_name() {
    let db = TestDb::new();
    db.insert(b"k", b"v").expect("insert");

    let default = db.open_tree(DEFAULT_TREE_NAME).expect("open_tree");
    assert_eq!(default.get(b"k").expect("get"), Some(b"v".to_vec()));
    assert_eq!(db.name(), DEFAULT_TREE_NAME.to_vec());
    assert_eq!(
        db.tree_names().expect("tree_names"),
        vec![DEFAULT_TREE_NAME.to_vec()]
    );
}

#[test]
fn test_default_tree_cannot_be_dropped() {
    let db = TestDb::new();
    db.insert(b"k", b"v").expect("insert");

    assert!(matches!(
        db.drop_tree(DEFAULT_TREE_NAME),
        Err(Error::Unsupported(_))
    ));
    assert_eq!(db.get(b"k").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn test_reopen_reports_recovery() {
    let db = TestDb::new();
    assert!(!db.was_recovered());

    let db = db.reopen();
    assert!(db.was_recovered());
}

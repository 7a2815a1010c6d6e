//! A batch is applied completely or not at all.

use crate::Batch;
use crate::Error;
use crate::e2e_tests::helpers::*;
use crate::testing::TestDb;

fn three_inserts() -> Batch {
    let entries: [(&[u8], &[u8]); 3] = [(b"alice", b"10"), (b"bob", b"20"), (b"carol", b"30")];
    entries.into_iter().collect()
}

#[test]
fn test_failed_batch_leaves_tree_unchanged() {
    let db = TestDb::new();
    db.insert(b"existing", b"1").expect("insert");
    let before = entries(&db);

    db.inner().store.file().faults().fail_next_write();
    assert!(matches!(db.apply_batch(three_inserts()), Err(Error::Io(_))));

    assert_eq!(entries(&db), before);
    for key in [&b"alice"[..], b"bob", b"carol"] {
        assert!(db.get(key).expect("get").is_none());
    }

    let db = db.reopen();
    assert_eq!(entries(&db), before);
}

#[test]
fn test_torn_batch_is_discarded_on_reopen() {
    let db = TestDb::new();
    db.insert(b"existing", b"1").expect("insert");

    // Begin, alice and part of bob reach the file.
    db.inner().store.file().faults().tear_next_write(100);
    assert!(db.apply_batch(three_inserts()).is_err());

    let db = db.reopen();
    assert_eq!(db.len().expect("len"), 1);
    assert!(db.get(b"alice").expect("get").is_none());

    // The log continues after the discarded group.
    db.apply_batch(three_inserts()).expect("apply_batch");
    let db = db.reopen();
    assert_eq!(db.len().expect("len"), 4);
}

#[test]
fn test_successful_batch_survives_reopen() {
    let db = TestDb::new();
    let mut batch = three_inserts();
    batch.remove(b"bob");
    db.apply_batch(batch).expect("apply_batch");

    let db = db.reopen();
    assert_eq!(
        entries(&db),
        vec![
            (b"alice".to_vec(), b"10".to_vec()),
            (b"carol".to_vec(), b"30".to_vec()),
        ]
    );
}

#[test]
fn test_iterator_never_sees_part_of_a_batch() {
    let db = TestDb::new();
    let before = db.iter().expect("iter");
    db.apply_batch(three_inserts()).expect("apply_batch");
    let after = db.iter().expect("iter");

    assert_eq!(before.count(), 0);
    assert_eq!(after.count(), 3);
}

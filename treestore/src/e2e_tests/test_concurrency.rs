//! Many threads sharing one database.

use std::sync::{Arc, Barrier};
use std::thread;

use crate::Batch;
use crate::testing::TestDb;

const THREADS: usize = 8;

#[test]
fn test_concurrent_open_tree_creates_one_tree() {
    let db = TestDb::new();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let db = (*db).clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let tree = db.open_tree(b"contended").expect("open_tree");
                tree.insert(i.to_be_bytes(), b"x").expect("insert");
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    let tree = db.open_tree(b"contended").expect("open_tree");
    assert_eq!(tree.len().expect("len"), THREADS);
    assert_eq!(db.tree_names().expect("tree_names").len(), 2);
}

#[test]
fn test_concurrent_writers_on_one_tree() {
    let db = TestDb::new();
    let tree = db.open_tree(b"counters").expect("open_tree");

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = tree.clone();
            thread::spawn(move || {
                for i in 0..200u32 {
                    tree.insert(format!("{t}-{i:03}"), i.to_be_bytes())
                        .expect("insert");
                    if i % 3 == 0 {
                        tree.remove(format!("{t}-{i:03}")).expect("remove");
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("thread panicked");
    }

    // 67 of every thread's 200 keys were removed.
    assert_eq!(tree.len().expect("len"), THREADS * 133);
    assert_eq!(tree.iter().expect("iter").count(), THREADS * 133);
    drop(tree);

    let db = db.reopen();
    let tree = db.open_tree(b"counters").expect("open_tree");
    assert_eq!(tree.len().expect("len"), THREADS * 133);
}

#[test]
fn test_readers_see_whole_batches() {
    let db = TestDb::new();
    let keys: Vec<Vec<u8>> = (0..20u8).map(|i| vec![b'k', i]).collect();
    let initial: Batch = keys.iter().map(|k| (k.clone(), 0u32.to_be_bytes())).collect();
    db.apply_batch(initial).expect("apply_batch");

    let writer = {
        let db = (*db).clone();
        let keys = keys.clone();
        thread::spawn(move || {
            for round in 1..=300u32 {
                let batch: Batch = keys.iter().map(|k| (k.clone(), round.to_be_bytes())).collect();
                db.apply_batch(batch).expect("apply_batch");
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = (*db).clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let values: Vec<Vec<u8>> = db
                        .iter()
                        .expect("iter")
                        .values()
                        .map(|v| v.expect("value"))
                        .collect();
                    assert_eq!(values.len(), 20);
                    assert!(
                        values.iter().all(|v| v == &values[0]),
                        "iterator observed a partial batch"
                    );
                }
            })
        })
        .collect();

    writer.join().expect("writer panicked");
    for reader in readers {
        reader.join().expect("reader panicked");
    }
    assert_eq!(db.get(vec![b'k', 0]).expect("get"), Some(300u32.to_be_bytes().to_vec()));
}

#[test]
fn test_iterator_outlives_checkpoints_and_writes() {
    let db = TestDb::new();
    for i in 0..300u32 {
        db.insert(i.to_be_bytes(), vec![1u8; 200]).expect("insert");
    }
    db.checkpoint().expect("checkpoint");

    let mut iter = db.iter().expect("iter");
    let first = iter.next().expect("first").expect("entry");

    // Rewrite everything and checkpoint enough times that any unpinned
    // retired extent would be reused.
    for round in 0..3u8 {
        for i in 0..300u32 {
            db.insert(i.to_be_bytes(), vec![round + 2; 200]).expect("insert");
        }
        db.checkpoint().expect("checkpoint");
    }

    assert_eq!(first.1, vec![1u8; 200]);
    let rest: Vec<_> = iter.map(|entry| entry.expect("entry")).collect();
    assert_eq!(rest.len(), 299);
    assert!(rest.iter().all(|(_, v)| v == &vec![1u8; 200]));
}

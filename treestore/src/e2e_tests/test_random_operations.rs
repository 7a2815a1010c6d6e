//! Random operations checked against an in-memory model.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Batch;
use crate::e2e_tests::helpers::*;
use crate::testing::TestDb;

type Model = BTreeMap<Vec<u8>, Vec<u8>>;

fn random_key(rng: &mut StdRng) -> Vec<u8> {
    format!("key{:03}", rng.random_range(0..300u32)).into_bytes()
}

fn random_value(rng: &mut StdRng) -> Vec<u8> {
    let len = rng.random_range(0..600usize);
    vec![rng.random::<u8>(); len]
}

fn check(db: &TestDb, trees: &[&[u8]], models: &[Model]) {
    for (name, model) in trees.iter().zip(models) {
        let tree = db.open_tree(name).expect("open_tree");
        let expected: Vec<_> = model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(entries(&tree), expected);
        assert_eq!(tree.len().expect("len"), model.len());
    }
}

#[test]
fn test_random_operations_match_model() {
    let mut rng = StdRng::seed_from_u64(7);
    let names: [&[u8]; 2] = [b"left", b"right"];
    let mut models = [Model::new(), Model::new()];
    let mut db = TestDb::new();

    for step in 0..3000u32 {
        let which = rng.random_range(0..names.len());
        let tree = db.open_tree(names[which]).expect("open_tree");
        let model = &mut models[which];

        match rng.random_range(0..100u32) {
            0..50 => {
                let key = random_key(&mut rng);
                let value = random_value(&mut rng);
                let previous = tree.insert(&key, &value).expect("insert");
                assert_eq!(previous, model.insert(key, value));
            }
            50..75 => {
                let key = random_key(&mut rng);
                assert_eq!(tree.remove(&key).expect("remove"), model.remove(&key));
            }
            75..90 => {
                let mut batch = Batch::default();
                for _ in 0..rng.random_range(1..20) {
                    let key = random_key(&mut rng);
                    if rng.random_bool(0.3) {
                        batch.remove(&key);
                        model.remove(&key);
                    } else {
                        let value = random_value(&mut rng);
                        batch.insert(&key, &value);
                        model.insert(key, value);
                    }
                }
                tree.apply_batch(batch).expect("apply_batch");
            }
            90..98 => {
                let key = random_key(&mut rng);
                let new = random_value(&mut rng);
                let current = model.get(&key).cloned();
                tree.compare_and_swap(&key, current.as_deref(), Some(&new))
                    .expect("compare_and_swap")
                    .expect("current value matches");
                model.insert(key, new);
            }
            _ => {
                tree.clear().expect("clear");
                model.clear();
            }
        }

        drop(tree);
        if step % 500 == 499 {
            check(&db, &names, &models);
            db = db.reopen();
            check(&db, &names, &models);
        }
    }
}

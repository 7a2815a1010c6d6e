//! Staged writes applied atomically by [`Tree::apply_batch`](crate::Tree::apply_batch).

use std::collections::BTreeMap;

/// An ordered set of inserts and removals.
///
/// Later operations on the same key replace earlier ones, so each key is
/// written at most once when the batch is applied.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[allow(clippy::disallowed_methods)]
pub struct Batch {
    ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl Batch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage an insert of `value` under `key`.
    pub fn insert(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.ops
            .insert(key.as_ref().to_vec(), Some(value.as_ref().to_vec()));
    }

    /// Stage a removal of `key`.
    pub fn remove(&mut self, key: impl AsRef<[u8]>) {
        self.ops.insert(key.as_ref().to_vec(), None);
    }

    /// Number of distinct keys touched.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged operations in key order. `None` marks a removal.
    pub(crate) fn into_ops(self) -> impl Iterator<Item = (Vec<u8>, Option<Vec<u8>>)> {
        self.ops.into_iter()
    }
}

impl<K: AsRef<[u8]>, V: AsRef<[u8]>> FromIterator<(K, V)> for Batch {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut batch = Self::new();
        for (key, value) in iter {
            batch.insert(key, value);
        }
        batch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::testing::TestDb;

    #[test]
    fn test_last_operation_per_key_wins() {
        let mut batch = Batch::new();
        batch.insert(b"k", b"1");
        batch.remove(b"k");
        batch.insert(b"j", b"2");
        batch.insert(b"j", b"3");

        assert_eq!(batch.len(), 2);
        let ops: Vec<_> = batch.into_ops().collect();
        assert_eq!(
            ops,
            vec![
                (b"j".to_vec(), Some(b"3".to_vec())),
                (b"k".to_vec(), None),
            ]
        );
    }

    #[test]
    fn test_apply_batch() {
        let db = TestDb::new();
        db.insert(b"gone", b"x").expect("insert");

        let mut batch: Batch = [(b"a", b"1"), (b"b", b"2")].into_iter().collect();
        batch.remove(b"gone");
        batch.remove(b"never-existed");
        db.apply_batch(batch).expect("apply");

        assert_eq!(db.len().expect("len"), 2);
        assert_eq!(db.get(b"a").expect("get"), Some(b"1".to_vec()));
        assert!(db.get(b"gone").expect("get").is_none());
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let db = TestDb::new();
        db.apply_batch(Batch::default()).expect("apply");
        assert_eq!(db.flush().expect("flush"), 0);
    }

    #[test]
    fn test_batch_on_dropped_tree() {
        let db = TestDb::new();
        let tree = db.open_tree(b"t").expect("open_tree");
        db.drop_tree(b"t").expect("drop");

        let batch: Batch = [(b"a", b"1")].into_iter().collect();
        assert!(matches!(
            tree.apply_batch(batch),
            Err(Error::TreeDropped { .. })
        ));
    }
}

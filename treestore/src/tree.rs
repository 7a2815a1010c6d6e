//! Handle to one named tree.

use std::ops::RangeBounds;
use std::sync::Arc;

use crate::batch::Batch;
use crate::db::Inner;
use crate::error::{CompareAndSwapError, Error, Result};
use crate::iter::Iter;
use crate::storage::btree::get;
use crate::storage::wal::LogRecordPayload;
use crate::storage::{Bytes, TreeId};

/// Whether a handle's tree still exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeState {
    Open,
    /// The tree was dropped; every data operation fails with [`Error::TreeDropped`].
    Dropped,
}

/// A named, ordered map from byte-string keys to byte-string values.
///
/// Handles are cheap to clone. Every operation is atomic and durable once
/// the database is flushed.
#[derive(Clone)]
#[allow(clippy::disallowed_methods)] // Clone shares the Arcs
pub struct Tree {
    inner: Arc<Inner>,
    id: TreeId,
    name: Bytes,
}

impl Tree {
    pub(crate) const fn new(inner: Arc<Inner>, id: TreeId, name: Bytes) -> Self {
        Self { inner, id, name }
    }

    /// Insert `value` under `key`, returning the previous value.
    pub fn insert(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = Bytes::from(key.as_ref());
        let value = Bytes::from(value.as_ref());
        #[allow(clippy::disallowed_methods)] // Arc::clone shares key and value with the log record
        let ops = [LogRecordPayload::Insert {
            tree_id: self.id,
            key: Arc::clone(&key),
            value: Arc::clone(&value),
        }];
        self.inner.mutate(self.id, &self.name, &ops, |tree| {
            let previous = tree.insert(key, value)?;
            Ok((previous.map(|v| v.to_vec()), true))
        })
    }

    pub fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let snapshot = self.inner.snapshot(self.id, &self.name)?;
        let value = get(&self.inner.store, &snapshot.root, key.as_ref())?;
        Ok(value.map(|v| v.to_vec()))
    }

    /// Remove `key`, returning its value if it was present.
    ///
    /// Removing an absent key writes nothing to the log.
    pub fn remove(&self, key: impl AsRef<[u8]>) -> Result<Option<Vec<u8>>> {
        let key = Bytes::from(key.as_ref());
        #[allow(clippy::disallowed_methods)] // Arc::clone shares the key with the log record
        let ops = [LogRecordPayload::Remove {
            tree_id: self.id,
            key: Arc::clone(&key),
        }];
        self.inner.mutate(self.id, &self.name, &ops, |tree| {
            let previous = tree.remove(&key)?;
            let changed = previous.is_some();
            Ok((previous.map(|v| v.to_vec()), changed))
        })
    }

    pub fn contains_key(&self, key: impl AsRef<[u8]>) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Exact number of entries.
    pub fn len(&self) -> Result<usize> {
        let state = self.inner.read_state()?;
        let tree = state.get(self.id).ok_or_else(|| self.dropped())?;
        Ok(usize::try_from(tree.len).unwrap_or(usize::MAX))
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Iterate over every entry in ascending key order.
    ///
    /// The iterator sees the tree as it was when this was called.
    pub fn iter(&self) -> Result<Iter> {
        self.range::<&[u8], _>(..)
    }

    /// Iterate over the entries whose keys fall in `range`.
    #[allow(clippy::disallowed_methods)] // Arc::clone keeps the database alive for the iterator
    pub fn range<K, R>(&self, range: R) -> Result<Iter>
    where
        K: AsRef<[u8]>,
        R: RangeBounds<K>,
    {
        let snapshot = self.inner.snapshot(self.id, &self.name)?;
        let start = range.start_bound().map(|k| k.as_ref().to_vec());
        let end = range.end_bound().map(|k| k.as_ref().to_vec());
        Ok(Iter::new(Arc::clone(&self.inner), snapshot, start, end))
    }

    /// Apply every operation in `batch` atomically.
    pub fn apply_batch(&self, batch: Batch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let ops: Vec<LogRecordPayload> = batch
            .into_ops()
            .map(|(key, value)| match value {
                Some(value) => LogRecordPayload::Insert {
                    tree_id: self.id,
                    key: Bytes::from(key),
                    value: Bytes::from(value),
                },
                None => LogRecordPayload::Remove {
                    tree_id: self.id,
                    key: Bytes::from(key),
                },
            })
            .collect();

        self.inner.mutate(self.id, &self.name, &ops, |tree| {
            for op in &ops {
                match op {
                    #[allow(clippy::disallowed_methods)] // Arc::clone of staged bytes
                    LogRecordPayload::Insert { key, value, .. } => {
                        tree.insert(Arc::clone(key), Arc::clone(value))?;
                    }
                    LogRecordPayload::Remove { key, .. } => {
                        tree.remove(key)?;
                    }
                    _ => {}
                }
            }
            Ok(((), true))
        })
    }

    /// Remove every entry atomically.
    pub fn clear(&self) -> Result<()> {
        let ops = [LogRecordPayload::Clear { tree_id: self.id }];
        self.inner.mutate(self.id, &self.name, &ops, |tree| {
            let changed = tree.len() > 0;
            tree.clear()?;
            Ok(((), changed))
        })
    }

    /// Replace the value of `key` with `new` if it currently equals `old`.
    ///
    /// `None` as `old` means the key must be absent; `None` as `new` removes
    /// it. On a mismatch nothing is written and the current value is returned
    /// in the inner error.
    pub fn compare_and_swap(
        &self,
        key: impl AsRef<[u8]>,
        old: Option<impl AsRef<[u8]>>,
        new: Option<impl AsRef<[u8]>>,
    ) -> Result<std::result::Result<(), CompareAndSwapError>> {
        let key = Bytes::from(key.as_ref());
        let old: Option<&[u8]> = old.as_ref().map(|v| v.as_ref());
        let new = new.as_ref().map(|v| Bytes::from(v.as_ref()));

        #[allow(clippy::disallowed_methods)] // Arc::clone shares key and value with the log record
        let ops = [match &new {
            Some(value) => LogRecordPayload::Insert {
                tree_id: self.id,
                key: Arc::clone(&key),
                value: Arc::clone(value),
            },
            None => LogRecordPayload::Remove {
                tree_id: self.id,
                key: Arc::clone(&key),
            },
        }];

        self.inner.mutate(self.id, &self.name, &ops, |tree| {
            let current = tree.get(&key)?;
            if current.as_deref() != old {
                let conflict = CompareAndSwapError {
                    current: current.map(|v| v.to_vec()),
                    proposed: new.map(|v| v.to_vec()),
                };
                return Ok((Err(conflict), false));
            }

            match new {
                Some(value) => {
                    tree.insert(key, value)?;
                }
                None => {
                    tree.remove(&key)?;
                }
            }
            Ok((Ok(()), true))
        })
    }

    /// CRC32 over every key and value, in key order.
    pub fn checksum(&self) -> Result<u32> {
        let mut hasher = crc32fast::Hasher::new();
        for entry in self.iter()? {
            let (key, value) = entry?;
            hasher.update(&key);
            hasher.update(&value);
        }
        Ok(hasher.finalize())
    }

    /// Make every committed mutation in the database durable.
    pub fn flush(&self) -> Result<usize> {
        self.inner.flush()
    }

    #[must_use]
    pub fn name(&self) -> Vec<u8> {
        self.name.to_vec()
    }

    #[must_use]
    pub fn state(&self) -> TreeState {
        if self.inner.tree_exists(self.id) {
            TreeState::Open
        } else {
            TreeState::Dropped
        }
    }

    fn dropped(&self) -> Error {
        Error::TreeDropped {
            name: self.name.to_vec(),
        }
    }
}

impl std::fmt::Debug for Tree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tree")
            .field("id", &self.id)
            .field("name", &String::from_utf8_lossy(&self.name))
            .finish_non_exhaustive()
    }
}

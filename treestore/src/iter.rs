//! Ordered iteration over a tree snapshot.
//!
//! An [`Iter`] walks the root it was created with, keeping a stack of internal
//! nodes and the position of the next child to visit in each. Nodes are
//! immutable and the iterator pins the reclamation epoch, so writers never
//! wait for it and it never sees their changes.

use std::ops::Bound;
use std::sync::Arc;

use crate::db::{Inner, Snapshot};
use crate::error::{Error, Result};
use crate::storage::btree::{Link, Node};
use crate::storage::reclaim::EpochPin;

/// Iterator over `(key, value)` pairs in ascending key order.
///
/// Fuses after yielding an error.
pub struct Iter {
    inner: Arc<Inner>,
    _pin: EpochPin,
    /// Root to seek from on the first call to `next`.
    root: Option<Link>,
    start: Bound<Vec<u8>>,
    end: Bound<Vec<u8>>,
    stack: Vec<(Arc<Node>, usize)>,
    leaf: Option<(Arc<Node>, usize)>,
    done: bool,
}

impl Iter {
    pub(crate) fn new(
        inner: Arc<Inner>,
        snapshot: Snapshot,
        start: Bound<Vec<u8>>,
        end: Bound<Vec<u8>>,
    ) -> Self {
        Self {
            inner,
            _pin: snapshot.pin,
            root: Some(snapshot.root),
            start,
            end,
            stack: Vec::new(),
            leaf: None,
            done: false,
        }
    }

    /// Iterate over keys only.
    pub fn keys(self) -> impl Iterator<Item = Result<Vec<u8>>> {
        self.map(|entry| entry.map(|(key, _)| key))
    }

    /// Iterate over values only.
    pub fn values(self) -> impl Iterator<Item = Result<Vec<u8>>> {
        self.map(|entry| entry.map(|(_, value)| value))
    }

    /// Descend from the root to the leaf holding the start bound.
    fn seek(&mut self, root: &Link) -> Result<()> {
        let mut node = self.inner.store.load(root)?;
        loop {
            let (index, child) = match node.as_ref() {
                Node::Leaf(leaf) => {
                    let position = match &self.start {
                        Bound::Unbounded => 0,
                        Bound::Included(key) => leaf.search(key).unwrap_or_else(|i| i),
                        Bound::Excluded(key) => leaf.search(key).map_or_else(|i| i, |i| i + 1),
                    };
                    self.leaf = Some((node, position));
                    return Ok(());
                }
                Node::Internal(internal) => {
                    let index = match &self.start {
                        Bound::Unbounded => 0,
                        Bound::Included(key) | Bound::Excluded(key) => internal.child_index(key),
                    };
                    (index, internal.children.get(index).cloned())
                }
            };

            let Some(child) = child else {
                return Err(Error::Corruption(
                    "internal node child index out of range".into(),
                ));
            };
            // Siblings after `index` are visited once this subtree is exhausted.
            self.stack.push((node, index + 1));
            node = self.inner.store.load(&child)?;
        }
    }

    /// Move to the next leaf, descending through unvisited children.
    ///
    /// Returns `false` when the tree is exhausted.
    fn next_leaf(&mut self) -> Result<bool> {
        while let Some((node, index)) = self.stack.last_mut() {
            let Node::Internal(internal) = node.as_ref() else {
                self.stack.pop();
                continue;
            };
            let Some(child) = internal.children.get(*index).cloned() else {
                self.stack.pop();
                continue;
            };
            *index += 1;

            let mut node = self.inner.store.load(&child)?;
            loop {
                let first = match node.as_ref() {
                    Node::Leaf(_) => {
                        self.leaf = Some((node, 0));
                        return Ok(true);
                    }
                    Node::Internal(internal) => internal.children.first().cloned(),
                };
                let Some(first) = first else {
                    break;
                };
                self.stack.push((node, 1));
                node = self.inner.store.load(&first)?;
            }
        }
        Ok(false)
    }

    fn advance(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if let Some(root) = self.root.take() {
            self.seek(&root)?;
        }

        loop {
            if let Some((leaf, position)) = self.leaf.as_mut()
                && let Node::Leaf(entries) = leaf.as_ref()
                && let Some((key, value)) = entries.entries.get(*position)
            {
                *position += 1;
                if past_end(&self.end, key) {
                    return Ok(None);
                }
                return Ok(Some((key.to_vec(), value.to_vec())));
            }

            self.leaf = None;
            if !self.next_leaf()? {
                return Ok(None);
            }
        }
    }
}

fn past_end(end: &Bound<Vec<u8>>, key: &[u8]) -> bool {
    match end {
        Bound::Unbounded => false,
        Bound::Included(end) => key > end.as_slice(),
        Bound::Excluded(end) => key >= end.as_slice(),
    }
}

impl Iterator for Iter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for Iter {}

impl std::fmt::Debug for Iter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

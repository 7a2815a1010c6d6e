//! Copy-on-write B-tree operations.
//!
//! Readers walk from a root [`Link`] they obtained under the state lock and
//! never observe a node change underneath them. Writers go through
//! [`TreeWriter`], which copies every node on the path it modifies and
//! collects the disk extents those copies replace.
//!
//! # Invariants
//!
//! - Leaf entries are sorted by key and unique.
//! - Keys in child `i` of an internal node are `< keys[i]`; keys in child
//!   `i + 1` are `>= keys[i]`.
//! - No node is empty except a root leaf.
//! - Nodes are split until they fit in one page or can no longer be split.
//!
//! Deletion never merges siblings. Underfull nodes are tolerated; empty ones
//! are unlinked from their parent and a root with a single child collapses.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::Bytes;
use crate::storage::btree::node::{InternalNode, LeafNode, Link, Node};
use crate::storage::page::{EXTENT_USABLE_SPACE, Extent};
use crate::storage::store::PageStore;

fn missing_child(index: usize) -> Error {
    Error::Corruption(format!("internal node has no child at index {index}"))
}

/// Look up `key` in the tree rooted at `root`.
pub fn get(store: &PageStore, root: &Link, key: &[u8]) -> Result<Option<Bytes>> {
    let mut node = store.load(root)?;
    loop {
        let next = match node.as_ref() {
            Node::Leaf(leaf) => {
                #[allow(clippy::disallowed_methods)] // Arc::clone hands out the stored value
                let value = leaf.search(key).ok().map(|i| Arc::clone(&leaf.entries[i].1));
                return Ok(value);
            }
            Node::Internal(internal) => {
                let index = internal.child_index(key);
                let child = internal
                    .children
                    .get(index)
                    .ok_or_else(|| missing_child(index))?;
                store.load(child)?
            }
        };
        node = next;
    }
}

/// Append every extent reachable from `link` to `out`.
///
/// Disk subtrees are loaded to discover their children, so this can fail with
/// a read or corruption error.
pub fn collect_extents(store: &PageStore, link: &Link, out: &mut Vec<Extent>) -> Result<()> {
    if let Link::Disk(extent) = link {
        out.push(*extent);
    }
    let node = store.load(link)?;
    if let Node::Internal(internal) = node.as_ref() {
        for child in &internal.children {
            collect_extents(store, child, out)?;
        }
    }
    Ok(())
}

/// Split an oversized leaf. Returns the first piece and pushes the others,
/// each with its lower-bound separator, onto `rest`.
fn split_leaf(leaf: LeafNode, rest: &mut Vec<(Bytes, Node)>) -> Node {
    if leaf.entries.len() < 2 || leaf.encoded_size() <= EXTENT_USABLE_SPACE {
        return Node::Leaf(leaf);
    }
    let (left, separator, right) = leaf.split();
    let first = split_leaf(left, rest);
    let mut right_rest = Vec::new();
    let right_first = split_leaf(right, &mut right_rest);
    rest.push((separator, right_first));
    rest.extend(right_rest);
    first
}

/// Split an oversized internal node, as [`split_leaf`] does for leaves.
fn split_internal(internal: InternalNode, rest: &mut Vec<(Bytes, Node)>) -> Node {
    if internal.keys.len() < 3 || internal.encoded_size() <= EXTENT_USABLE_SPACE {
        return Node::Internal(internal);
    }
    let (left, separator, right) = internal.split();
    let first = split_internal(left, rest);
    let mut right_rest = Vec::new();
    let right_first = split_internal(right, &mut right_rest);
    rest.push((separator, right_first));
    rest.extend(right_rest);
    first
}

/// Build new root levels until the pieces fit under a single root.
fn grow_root(first: Node, rest: Vec<(Bytes, Node)>) -> Link {
    if rest.is_empty() {
        return Link::Mem(Arc::new(first));
    }

    let mut keys = Vec::with_capacity(rest.len());
    let mut children = Vec::with_capacity(rest.len() + 1);
    children.push(Link::Mem(Arc::new(first)));
    for (separator, node) in rest {
        keys.push(separator);
        children.push(Link::Mem(Arc::new(node)));
    }

    let mut next_rest = Vec::new();
    let next_first = split_internal(InternalNode { keys, children }, &mut next_rest);
    grow_root(next_first, next_rest)
}

/// Outcome of removing a key from a subtree.
enum Removal {
    Absent,
    /// The key was removed; the new subtree is `None` if it became empty.
    Removed(Option<Node>, Bytes),
}

/// Working copy of one tree during a write.
///
/// Nothing is visible to readers until the caller publishes [`TreeWriter::finish`].
pub struct TreeWriter<'a> {
    store: &'a PageStore,
    root: Link,
    len: u64,
    retired: Vec<Extent>,
}

impl<'a> TreeWriter<'a> {
    #[must_use]
    pub const fn new(store: &'a PageStore, root: Link, len: u64) -> Self {
        Self {
            store,
            root,
            len,
            retired: Vec::new(),
        }
    }

    /// Number of entries in the working copy.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Read from the working copy, including this writer's own changes.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        get(self.store, &self.root, key)
    }

    /// Insert or overwrite `key`, returning the previous value.
    pub fn insert(&mut self, key: Bytes, value: Bytes) -> Result<Option<Bytes>> {
        let mut previous = None;
        let root = self.root.clone();
        let mut rest = Vec::new();
        let first = self.insert_into(&root, key, value, &mut previous, &mut rest)?;
        self.root = grow_root(first, rest);
        if previous.is_none() {
            self.len += 1;
        }
        Ok(previous)
    }

    /// Remove `key`, returning its value if it was present.
    ///
    /// Removing an absent key leaves the tree untouched and retires nothing.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Bytes>> {
        let root = self.root.clone();
        match self.remove_from(&root, key)? {
            Removal::Absent => Ok(None),
            Removal::Removed(node, value) => {
                self.root = match node {
                    Some(node) => self.collapse(Link::Mem(Arc::new(node)))?,
                    None => Link::empty(),
                };
                self.len = self.len.saturating_sub(1);
                Ok(Some(value))
            }
        }
    }

    /// Remove every entry.
    pub fn clear(&mut self) -> Result<()> {
        let root = std::mem::replace(&mut self.root, Link::empty());
        collect_extents(self.store, &root, &mut self.retired)?;
        self.len = 0;
        Ok(())
    }

    /// Consume the writer, returning the new root, the entry count, and the
    /// extents no longer reachable from the new root.
    #[must_use]
    pub fn finish(self) -> (Link, u64, Vec<Extent>) {
        (self.root, self.len, self.retired)
    }

    fn retire(&mut self, link: &Link) {
        if let Link::Disk(extent) = link {
            self.retired.push(*extent);
        }
    }

    fn insert_into(
        &mut self,
        link: &Link,
        key: Bytes,
        value: Bytes,
        previous: &mut Option<Bytes>,
        rest: &mut Vec<(Bytes, Node)>,
    ) -> Result<Node> {
        let node = self.store.load(link)?;
        self.retire(link);

        match node.as_ref() {
            Node::Leaf(leaf) => {
                let mut leaf = leaf.clone();
                match leaf.search(&key) {
                    Ok(i) => *previous = Some(std::mem::replace(&mut leaf.entries[i].1, value)),
                    Err(i) => leaf.entries.insert(i, (key, value)),
                }
                Ok(split_leaf(leaf, rest))
            }
            Node::Internal(internal) => {
                let mut internal = internal.clone();
                let index = internal.child_index(&key);
                let child = internal
                    .children
                    .get(index)
                    .cloned()
                    .ok_or_else(|| missing_child(index))?;

                let mut child_rest = Vec::new();
                let child_first =
                    self.insert_into(&child, key, value, previous, &mut child_rest)?;

                internal.children[index] = Link::Mem(Arc::new(child_first));
                for (offset, (separator, node)) in child_rest.into_iter().enumerate() {
                    internal.keys.insert(index + offset, separator);
                    internal
                        .children
                        .insert(index + offset + 1, Link::Mem(Arc::new(node)));
                }
                Ok(split_internal(internal, rest))
            }
        }
    }

    fn remove_from(&mut self, link: &Link, key: &[u8]) -> Result<Removal> {
        let node = self.store.load(link)?;

        match node.as_ref() {
            Node::Leaf(leaf) => {
                let Ok(i) = leaf.search(key) else {
                    return Ok(Removal::Absent);
                };
                self.retire(link);
                let mut leaf = leaf.clone();
                let (_, value) = leaf.entries.remove(i);
                let node = (!leaf.entries.is_empty()).then_some(Node::Leaf(leaf));
                Ok(Removal::Removed(node, value))
            }
            Node::Internal(internal) => {
                let index = internal.child_index(key);
                let child = internal
                    .children
                    .get(index)
                    .ok_or_else(|| missing_child(index))?;

                let Removal::Removed(child_node, value) = self.remove_from(child, key)? else {
                    return Ok(Removal::Absent);
                };
                self.retire(link);

                let mut internal = internal.clone();
                if let Some(child_node) = child_node {
                    internal.children[index] = Link::Mem(Arc::new(child_node));
                } else {
                    internal.children.remove(index);
                    if index > 0 {
                        internal.keys.remove(index - 1);
                    } else if !internal.keys.is_empty() {
                        internal.keys.remove(0);
                    }
                }

                let node = (!internal.children.is_empty()).then_some(Node::Internal(internal));
                Ok(Removal::Removed(node, value))
            }
        }
    }

    /// Replace internal roots that have a single child with that child.
    fn collapse(&self, mut link: Link) -> Result<Link> {
        loop {
            let node = self.store.load(&link)?;
            match node.as_ref() {
                Node::Internal(internal) if internal.children.len() == 1 => {
                    link = internal.children[0].clone();
                }
                _ => return Ok(link),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::file::DatabaseFile;
    use crate::storage::wal::MIN_WAL_CAPACITY;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;
    use tempfile::{TempDir, tempdir};

    fn test_store() -> (TempDir, PageStore) {
        let dir = tempdir().expect("create temp dir");
        let (file, _) =
            DatabaseFile::create(&dir.path().join("test.db"), MIN_WAL_CAPACITY).expect("create");
        (dir, PageStore::new(file, 1 << 20))
    }

    fn bytes(b: &[u8]) -> Bytes {
        Arc::from(b)
    }

    /// In-order walk of every entry, checking the separator invariant on the way.
    fn entries(store: &PageStore, link: &Link) -> Vec<(Vec<u8>, Vec<u8>)> {
        fn walk(
            store: &PageStore,
            link: &Link,
            low: Option<&[u8]>,
            high: Option<&[u8]>,
            out: &mut Vec<(Vec<u8>, Vec<u8>)>,
        ) {
            let node = store.load(link).expect("load");
            match node.as_ref() {
                Node::Leaf(leaf) => {
                    for (k, v) in &leaf.entries {
                        assert!(low.is_none_or(|low| k.as_ref() >= low));
                        assert!(high.is_none_or(|high| k.as_ref() < high));
                        out.push((k.to_vec(), v.to_vec()));
                    }
                }
                Node::Internal(internal) => {
                    assert_eq!(internal.keys.len() + 1, internal.children.len());
                    for (i, child) in internal.children.iter().enumerate() {
                        let child_low = if i == 0 { low } else { Some(&*internal.keys[i - 1]) };
                        let child_high = internal.keys.get(i).map(|k| &**k).or(high);
                        walk(store, child, child_low, child_high, out);
                    }
                }
            }
        }
        let mut out = Vec::new();
        walk(store, link, None, None, &mut out);
        out
    }

    #[test]
    fn test_insert_get_overwrite() {
        let (_dir, store) = test_store();
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);

        assert_eq!(writer.insert(bytes(b"k"), bytes(b"v1")).expect("insert"), None);
        let previous = writer.insert(bytes(b"k"), bytes(b"v2")).expect("insert");
        assert_eq!(previous.as_deref(), Some(&b"v1"[..]));
        assert_eq!(writer.get(b"k").expect("get").as_deref(), Some(&b"v2"[..]));
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn test_remove_absent_key_changes_nothing() {
        let (_dir, store) = test_store();
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);
        writer.insert(bytes(b"a"), bytes(b"1")).expect("insert");

        assert_eq!(writer.remove(b"zzz").expect("remove"), None);
        let (_, len, retired) = writer.finish();
        assert_eq!(len, 1);
        assert!(retired.is_empty());
    }

    #[test]
    fn test_splits_keep_order() {
        let (_dir, store) = test_store();
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);

        // 200-byte values force many leaf and internal splits.
        for i in (0..2000u32).rev() {
            let key = format!("key{i:05}");
            writer
                .insert(bytes(key.as_bytes()), bytes(&[i as u8; 200]))
                .expect("insert");
        }

        let (root, len, _) = writer.finish();
        assert_eq!(len, 2000);
        let all = entries(&store, &root);
        assert_eq!(all.len(), 2000);
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(matches!(store.load(&root).expect("root").as_ref(), Node::Internal(_)));
    }

    #[test]
    fn test_oversized_value_gets_its_own_leaf() {
        let (_dir, store) = test_store();
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);
        writer.insert(bytes(b"a"), bytes(b"small")).expect("insert");
        writer
            .insert(bytes(b"b"), bytes(&vec![1u8; 3 * EXTENT_USABLE_SPACE]))
            .expect("insert");
        writer.insert(bytes(b"c"), bytes(b"small")).expect("insert");

        let (root, _, _) = writer.finish();
        let all = entries(&store, &root);
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].1.len(), 3 * EXTENT_USABLE_SPACE);
    }

    #[test]
    fn test_remove_everything_collapses_to_empty_leaf() {
        let (_dir, store) = test_store();
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);
        for i in 0..500u32 {
            writer
                .insert(bytes(&i.to_be_bytes()), bytes(&[0u8; 100]))
                .expect("insert");
        }
        for i in 0..500u32 {
            assert!(writer.remove(&i.to_be_bytes()).expect("remove").is_some());
        }

        let (root, len, _) = writer.finish();
        assert_eq!(len, 0);
        let node = store.load(&root).expect("root");
        assert!(matches!(node.as_ref(), Node::Leaf(leaf) if leaf.entries.is_empty()));
    }

    #[test]
    fn test_random_operations_match_model() {
        let (_dir, store) = test_store();
        let mut rng = StdRng::seed_from_u64(0x7EE5);
        let mut writer = TreeWriter::new(&store, Link::empty(), 0);
        let mut model = BTreeMap::new();

        for _ in 0..5000 {
            let key = format!("{:04}", rng.random_range(0..800u32)).into_bytes();
            if rng.random_bool(0.65) {
                let value = vec![rng.random::<u8>(); rng.random_range(0..300)];
                let expected = model.insert(key.clone(), value.clone());
                let actual = writer.insert(bytes(&key), bytes(&value)).expect("insert");
                assert_eq!(actual.map(|v| v.to_vec()), expected);
            } else {
                let expected = model.remove(&key);
                let actual = writer.remove(&key).expect("remove");
                assert_eq!(actual.map(|v| v.to_vec()), expected);
            }
        }

        let (root, len, _) = writer.finish();
        assert_eq!(len, model.len() as u64);
        let expected: Vec<_> = model.into_iter().collect();
        assert_eq!(entries(&store, &root), expected);
    }
}

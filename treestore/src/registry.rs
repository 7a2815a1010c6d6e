//! Registry of named trees, keyed by name and by stable id.
//!
//! The registry is the in-memory half of the catalog: for every live tree it
//! holds the published root and entry count. Checkpoints serialize it into a
//! catalog extent and recovery loads it back.
//!
//! # Invariants
//!
//! - Each name maps to exactly one id, and each id to exactly one name
//! - Ids are never reused, even after a tree is dropped
//! - The default tree exists from creation and always has id 0

// Tree counts fit in u32.
#![allow(clippy::cast_possible_truncation)]

use std::collections::{BTreeMap, HashMap};

use crate::storage::btree::Link;
use crate::storage::page::{ByteReader, Extent, write_prefixed};
use crate::storage::{Bytes, TreeId};

/// Name of the tree every database starts with.
pub const DEFAULT_TREE_NAME: &[u8] = b"__treestore__default";

/// Id of the default tree.
pub const DEFAULT_TREE_ID: TreeId = 0;

/// Published state of one tree.
#[derive(Debug, Clone)]
#[allow(clippy::disallowed_methods)] // Clone copies a Link and the name Arc
pub struct TreeRoot {
    pub name: Bytes,
    pub root: Link,
    pub len: u64,
}

/// Name and id bookkeeping for every live tree.
#[derive(Debug)]
pub struct TreeRegistry {
    by_name: HashMap<Bytes, TreeId>,
    trees: BTreeMap<TreeId, TreeRoot>,
    next_id: TreeId,
}

impl TreeRegistry {
    /// A registry holding only an empty default tree.
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Self {
            by_name: HashMap::new(),
            trees: BTreeMap::new(),
            next_id: DEFAULT_TREE_ID,
        };
        registry.create(Bytes::from(DEFAULT_TREE_NAME));
        registry
    }

    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<TreeId> {
        self.by_name.get(name).copied()
    }

    #[must_use]
    pub fn get(&self, id: TreeId) -> Option<&TreeRoot> {
        self.trees.get(&id)
    }

    pub fn get_mut(&mut self, id: TreeId) -> Option<&mut TreeRoot> {
        self.trees.get_mut(&id)
    }

    /// The id the next [`TreeRegistry::create`] will assign.
    #[must_use]
    pub const fn next_id(&self) -> TreeId {
        self.next_id
    }

    /// Register a new empty tree and return its id.
    ///
    /// # Pre-conditions
    ///
    /// - `name` is not registered
    pub fn create(&mut self, name: Bytes) -> TreeId {
        let id = self.next_id;
        self.insert(id, name, Link::empty(), 0);
        id
    }

    /// Register a tree under a known id, as replay and catalog loading do.
    pub fn insert(&mut self, id: TreeId, name: Bytes, root: Link, len: u64) {
        #[allow(clippy::disallowed_methods)] // Arc::clone shares the name between both maps
        self.by_name.insert(std::sync::Arc::clone(&name), id);
        self.trees.insert(id, TreeRoot { name, root, len });
        self.next_id = self.next_id.max(id + 1);
    }

    /// Unregister a tree, returning its last published state.
    pub fn remove(&mut self, id: TreeId) -> Option<TreeRoot> {
        let tree = self.trees.remove(&id)?;
        self.by_name.remove(&tree.name);
        Some(tree)
    }

    /// Names of all live trees, in id order.
    #[must_use]
    pub fn names(&self) -> Vec<Vec<u8>> {
        self.trees.values().map(|tree| tree.name.to_vec()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TreeId, &TreeRoot)> {
        self.trees.iter().map(|(id, tree)| (*id, tree))
    }

    #[cfg(test)]
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (TreeId, &mut TreeRoot)> {
        self.trees.iter_mut().map(|(id, tree)| (*id, tree))
    }

    /// Serialize the registry into a catalog payload.
    ///
    /// ```text
    /// next_id (8) | count (4) | { id (8) | len (8) | root_page (8) | root_pages (4) | name_len (4) | name }*
    /// ```
    ///
    /// Returns `None` if a root has not been written yet.
    #[must_use]
    pub fn encode_catalog(&self) -> Option<Vec<u8>> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.next_id.to_le_bytes());
        buf.extend_from_slice(&(self.trees.len() as u32).to_le_bytes());
        for (id, tree) in &self.trees {
            let root = tree.root.extent()?;
            buf.extend_from_slice(&id.to_le_bytes());
            buf.extend_from_slice(&tree.len.to_le_bytes());
            buf.extend_from_slice(&root.page.to_le_bytes());
            buf.extend_from_slice(&root.pages.to_le_bytes());
            write_prefixed(&mut buf, &tree.name);
        }
        Some(buf)
    }

    /// Rebuild a registry from a catalog payload.
    pub fn decode_catalog(payload: &[u8]) -> Result<Self, CatalogError> {
        let mut reader = ByteReader::new(payload);
        let next_id = reader.read_u64().ok_or(CatalogError::Truncated)?;
        let count = reader.read_u32().ok_or(CatalogError::Truncated)?;

        let mut registry = Self {
            by_name: HashMap::new(),
            trees: BTreeMap::new(),
            next_id,
        };
        for _ in 0..count {
            let id = reader.read_u64().ok_or(CatalogError::Truncated)?;
            let len = reader.read_u64().ok_or(CatalogError::Truncated)?;
            let page = reader.read_u64().ok_or(CatalogError::Truncated)?;
            let pages = reader.read_u32().ok_or(CatalogError::Truncated)?;
            let name = reader.read_prefixed().ok_or(CatalogError::Truncated)?;

            if registry.trees.contains_key(&id) || registry.lookup(name).is_some() {
                return Err(CatalogError::Duplicate(id));
            }
            if id >= next_id {
                return Err(CatalogError::IdOutOfRange { id, next_id });
            }
            registry.insert(id, Bytes::from(name), Link::Disk(Extent::new(page, pages)), len);
        }

        if reader.remaining() != 0 {
            return Err(CatalogError::TrailingBytes(reader.remaining()));
        }
        if registry.get(DEFAULT_TREE_ID).is_none() {
            return Err(CatalogError::MissingDefaultTree);
        }
        Ok(registry)
    }
}

impl Default for TreeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors from decoding a catalog.
#[derive(Debug, PartialEq, Eq)]
pub enum CatalogError {
    Truncated,
    TrailingBytes(usize),
    Duplicate(TreeId),
    IdOutOfRange { id: TreeId, next_id: TreeId },
    MissingDefaultTree,
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "catalog truncated"),
            Self::TrailingBytes(n) => write!(f, "catalog has {n} trailing bytes"),
            Self::Duplicate(id) => write!(f, "catalog lists tree {id} twice"),
            Self::IdOutOfRange { id, next_id } => {
                write!(f, "catalog tree id {id} is not below next id {next_id}")
            }
            Self::MissingDefaultTree => write!(f, "catalog has no default tree"),
        }
    }
}

impl std::error::Error for CatalogError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry_has_default_tree() {
        let registry = TreeRegistry::new();
        assert_eq!(registry.lookup(DEFAULT_TREE_NAME), Some(DEFAULT_TREE_ID));
        assert_eq!(registry.names(), vec![DEFAULT_TREE_NAME.to_vec()]);
        assert_eq!(registry.next_id(), 1);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut registry = TreeRegistry::new();
        let a = registry.create(Bytes::from(&b"a"[..]));
        registry.remove(a).expect("remove");
        assert_eq!(registry.lookup(b"a"), None);

        let again = registry.create(Bytes::from(&b"a"[..]));
        assert_ne!(a, again);
    }

    #[test]
    fn test_catalog_requires_written_roots() {
        let registry = TreeRegistry::new();
        assert!(registry.encode_catalog().is_none());
    }

    #[test]
    fn test_catalog_encode_decode() {
        let mut registry = TreeRegistry::new();
        let users = registry.create(Bytes::from(&b"users"[..]));
        let dropped = registry.create(Bytes::from(&b"tmp"[..]));
        registry.remove(dropped);

        for (id, tree) in registry.iter_mut() {
            tree.root = Link::Disk(Extent::new(100 + id, 1));
            tree.len = id * 10;
        }

        let payload = registry.encode_catalog().expect("roots are on disk");
        let decoded = TreeRegistry::decode_catalog(&payload).expect("decode");

        assert_eq!(decoded.next_id(), 3);
        assert_eq!(decoded.lookup(b"users"), Some(users));
        assert_eq!(decoded.lookup(b"tmp"), None);
        let tree = decoded.get(users).expect("users tree");
        assert_eq!(tree.len, 10);
        assert_eq!(tree.root.extent(), Some(Extent::new(101, 1)));
    }

    #[test]
    fn test_decode_rejects_truncated_catalog() {
        let mut registry = TreeRegistry::new();
        for (_, tree) in registry.iter_mut() {
            tree.root = Link::Disk(Extent::new(9, 1));
        }
        let payload = registry.encode_catalog().expect("encode");
        assert_eq!(
            TreeRegistry::decode_catalog(&payload[..payload.len() - 2]).err(),
            Some(CatalogError::Truncated)
        );
    }
}

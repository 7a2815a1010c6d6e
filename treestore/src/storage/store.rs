//! Page store: node I/O on top of the database file and node cache.
//!
//! This is the only component that turns extents into nodes and back. Readers
//! and the writer share it through `&PageStore`; the file uses positional I/O
//! and the cache has its own lock.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::storage::btree::{Link, Node};
use crate::storage::cache::{CacheStats, NodeCache};
use crate::storage::file::DatabaseFile;
use crate::storage::page::{Extent, PageType, decode_extent, encode_extent, pages_for_payload};
use crate::storage::reclaim::Reclaimer;

/// Shared node storage for every tree in a database.
pub struct PageStore {
    file: DatabaseFile,
    cache: NodeCache,
    reclaimer: Reclaimer,
}

impl PageStore {
    #[must_use]
    pub fn new(file: DatabaseFile, cache_bytes: usize) -> Self {
        Self {
            file,
            cache: NodeCache::new(cache_bytes),
            reclaimer: Reclaimer::new(),
        }
    }

    #[must_use]
    pub const fn file(&self) -> &DatabaseFile {
        &self.file
    }

    #[must_use]
    pub const fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Resolve a link to its node, reading through the cache for disk links.
    pub fn load(&self, link: &Link) -> Result<Arc<Node>> {
        match link {
            #[allow(clippy::disallowed_methods)] // Arc::clone shares the in-memory node
            Link::Mem(node) => Ok(Arc::clone(node)),
            Link::Disk(extent) => self.read_node(*extent),
        }
    }

    /// Read and decode the node stored in `extent`.
    ///
    /// A checksum or decoding failure is reported as [`Error::Corruption`].
    pub fn read_node(&self, extent: Extent) -> Result<Arc<Node>> {
        if let Some(node) = self.cache.get(extent.page) {
            return Ok(node);
        }

        let bytes = self.file.read_extent(extent)?;
        let (page_type, payload) = decode_extent(extent, &bytes)
            .map_err(|e| Error::Corruption(format!("node at page {}: {e}", extent.page)))?;
        let node = Arc::new(
            Node::decode(page_type, payload)
                .map_err(|e| Error::Corruption(format!("node at page {}: {e}", extent.page)))?,
        );

        #[allow(clippy::disallowed_methods)] // Arc::clone keeps one copy in the cache
        self.cache
            .insert(extent.page, Arc::clone(&node), payload.len());
        Ok(node)
    }

    /// Size of the extent needed to store `node`.
    #[must_use]
    pub fn pages_for(node: &Node) -> u32 {
        pages_for_payload(node.encoded_size())
    }

    /// Write `node` to `extent` and cache it under the extent's page.
    ///
    /// # Pre-conditions
    ///
    /// - `extent` was sized with [`PageStore::pages_for`] and lies within the file
    /// - every child of an internal node is already on disk
    pub fn write_node(&self, extent: Extent, node: Arc<Node>) -> Result<()> {
        let payload = node.encode()?;
        let bytes = encode_extent(node.page_type(), &payload);
        self.file.write_extent(extent, &bytes)?;
        self.cache.insert(extent.page, node, payload.len());
        Ok(())
    }

    /// Read a raw extent of the given type, such as the catalog.
    pub fn read_blob(&self, extent: Extent, expected: PageType) -> Result<Vec<u8>> {
        let bytes = self.file.read_extent(extent)?;
        let (page_type, payload) = decode_extent(extent, &bytes)?;
        if page_type != expected {
            return Err(Error::Corruption(format!(
                "page {} holds {page_type:?}, expected {expected:?}",
                extent.page
            )));
        }
        Ok(payload.to_vec())
    }

    /// Write a raw payload as an extent of the given type.
    pub fn write_blob(&self, extent: Extent, page_type: PageType, payload: &[u8]) -> Result<()> {
        let bytes = encode_extent(page_type, payload);
        self.file.write_extent(extent, &bytes)?;
        Ok(())
    }

    /// Forget any cached node for a page that is about to be reused.
    pub fn evict(&self, extent: Extent) {
        self.cache.remove(extent.page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::LeafNode;
    use crate::storage::wal::MIN_WAL_CAPACITY;
    use tempfile::{TempDir, tempdir};

    fn test_store() -> (TempDir, PageStore, Extent) {
        let dir = tempdir().expect("create temp dir");
        let (file, sb) =
            DatabaseFile::create(&dir.path().join("test.db"), MIN_WAL_CAPACITY).expect("create");
        let extent = Extent::new(sb.data_start_page(), 1);
        file.ensure_pages(extent.end()).expect("grow");
        (dir, PageStore::new(file, 1 << 20), extent)
    }

    fn leaf() -> Arc<Node> {
        Arc::new(Node::Leaf(LeafNode {
            entries: vec![(Arc::from(&b"k"[..]), Arc::from(&b"v"[..]))],
        }))
    }

    #[test]
    fn test_write_then_read_node() {
        let (_dir, store, extent) = test_store();
        store.write_node(extent, leaf()).expect("write");

        // Force a disk read.
        store.evict(extent);
        let node = store.read_node(extent).expect("read");
        let Node::Leaf(leaf) = node.as_ref() else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.entries[0].1.as_ref(), b"v");
    }

    #[test]
    fn test_corrupt_node_is_reported() {
        let (_dir, store, extent) = test_store();
        store.write_node(extent, leaf()).expect("write");
        store.evict(extent);

        store
            .file()
            .write_at(&[0xFF], extent.byte_offset() + 20)
            .expect("scribble");

        let result = store.read_node(extent);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_blob_type_is_checked() {
        let (_dir, store, extent) = test_store();
        store
            .write_blob(extent, PageType::Catalog, b"catalog")
            .expect("write");

        assert_eq!(
            store.read_blob(extent, PageType::Catalog).expect("read"),
            b"catalog"
        );
        assert!(matches!(
            store.read_blob(extent, PageType::BTreeLeaf),
            Err(Error::Corruption(_))
        ));
    }
}

//! Checkpointing and the writer-side state it operates on.
//!
//! A checkpoint makes every published tree root durable in the page store so
//! that the log can be emptied.
//!
//! # Checkpoint Triggers
//!
//! - The log is at least half full after a mutation
//! - A mutation's group does not fit in the remaining log space
//! - Manual trigger via `Db::checkpoint`
//! - Creating a database, so the file always has a valid catalog
//!
//! # Checkpoint Process
//!
//! 1. Free extents whose retirement is at least two checkpoints old
//! 2. Write every dirty node to a fresh extent, children before parents
//! 3. Swap each tree's root for its on-disk extent
//! 4. Write the catalog, then fsync
//! 5. Write the next superblock slot, then fsync
//! 6. Retire the previous catalog, advance the reclamation epoch, reset the log
//!
//! A crash before step 5 completes leaves the previous superblock in charge,
//! and everything it references is still intact because retired extents are
//! only reused two checkpoints later.

use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};
use crate::registry::TreeRegistry;
use crate::storage::TreeId;
use crate::storage::allocator::ExtentAllocator;
use crate::storage::btree::{InternalNode, Link, Node};
use crate::storage::page::{Extent, PageType, pages_for_payload};
use crate::storage::store::PageStore;
use crate::storage::superblock::Superblock;
use crate::storage::wal::{LogRecordPayload, Lsn, TxnId, Wal};

/// State owned by the single writer: the log, the allocator and the current
/// superblock. Guarded by the database's writer mutex.
#[derive(Debug)]
pub struct WriterState {
    pub wal: Wal,
    pub allocator: ExtentAllocator,
    pub superblock: Superblock,
    pub next_txn_id: TxnId,
}

/// Summary of one checkpoint, for logging and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    pub generation: u64,
    pub nodes_written: usize,
    pub extents_reclaimed: usize,
    pub total_pages: u64,
}

impl WriterState {
    /// Append one mutation group under a fresh transaction id.
    pub fn append(&mut self, store: &PageStore, ops: &[LogRecordPayload]) -> Result<Lsn> {
        let txn_id = self.next_txn_id;
        self.next_txn_id += 1;
        Ok(self.wal.append_group(store.file(), txn_id, ops)?)
    }

    /// Whether a group of `size` bytes fits in the remaining log space.
    #[must_use]
    pub const fn log_fits(&self, size: u64) -> bool {
        size <= self.wal.free_space()
    }

    /// Whether the log has filled past the automatic checkpoint threshold.
    #[must_use]
    pub const fn log_half_full(&self) -> bool {
        self.wal.head() * 2 >= self.wal.capacity()
    }

    /// Run a checkpoint.
    ///
    /// # Pre-conditions
    ///
    /// - The caller holds the writer lock, so no root changes while this runs
    pub fn checkpoint(
        &mut self,
        store: &PageStore,
        state: &RwLock<TreeRegistry>,
    ) -> Result<CheckpointStats> {
        let reclaimer = store.reclaimer();
        let reclaimable = reclaimer.take_reclaimable()?;
        for extent in &reclaimable {
            self.allocator.free(*extent);
            store.evict(*extent);
        }

        let roots: Vec<(TreeId, Link)> = state
            .read()
            .map_err(|_| Error::LockPoisoned)?
            .iter()
            .map(|(id, tree)| (id, tree.root.clone()))
            .collect();

        let mut nodes_written = 0;
        let mut written = Vec::with_capacity(roots.len());
        for (id, root) in &roots {
            let extent = self.persist(store, root, &mut nodes_written)?;
            written.push((*id, extent));
        }

        // Same contents, now backed by disk. Readers holding the old links
        // keep their in-memory nodes.
        let catalog = {
            let mut registry = state.write().map_err(|_| Error::LockPoisoned)?;
            for (id, extent) in written {
                if let Some(tree) = registry.get_mut(id) {
                    tree.root = Link::Disk(extent);
                }
            }
            registry
                .encode_catalog()
                .ok_or_else(|| Error::Corruption("tree root left dirty by checkpoint".into()))?
        };

        // If anything below fails the new catalog extent stays allocated
        // until the next open rebuilds the allocator.
        let catalog_extent = self.allocate(store, pages_for_payload(catalog.len()))?;
        store.write_blob(catalog_extent, PageType::Catalog, &catalog)?;
        store.file().sync()?;

        let superblock = Superblock {
            generation: self.superblock.generation + 1,
            total_page_count: self.allocator.total_pages(),
            checkpoint_lsn: self.wal.next_lsn(),
            next_txn_id: self.next_txn_id,
            catalog: Some(catalog_extent),
            ..self.superblock
        };
        store.file().write_superblock(&superblock)?;
        store.file().sync()?;
        let previous = std::mem::replace(&mut self.superblock, superblock);

        {
            // Pins are taken under the read lock, so the epoch only moves
            // between reader snapshots.
            let _registry = state.write().map_err(|_| Error::LockPoisoned)?;
            reclaimer.retire(previous.catalog)?;
            reclaimer.advance()?;
        }
        self.wal.reset(superblock.generation);

        let stats = CheckpointStats {
            generation: superblock.generation,
            nodes_written,
            extents_reclaimed: reclaimable.len(),
            total_pages: superblock.total_page_count,
        };
        let cache = store.cache_stats();
        tracing::debug!(
            generation = stats.generation,
            nodes_written = stats.nodes_written,
            extents_reclaimed = stats.extents_reclaimed,
            total_pages = stats.total_pages,
            cache_entries = cache.entries,
            cache_bytes = cache.used_bytes,
            cache_hits = cache.hits,
            cache_misses = cache.misses,
            "checkpoint complete"
        );
        Ok(stats)
    }

    /// Write the dirty part of a subtree, children first, and return the
    /// extent of its root.
    #[allow(clippy::disallowed_methods)] // Arc::clone, a leaf is written as is
    fn persist(&mut self, store: &PageStore, link: &Link, written: &mut usize) -> Result<Extent> {
        let node = match link {
            Link::Disk(extent) => return Ok(*extent),
            Link::Mem(node) => node,
        };

        let clean = match node.as_ref() {
            Node::Leaf(_) => Arc::clone(node),
            Node::Internal(internal) => {
                let mut children = Vec::with_capacity(internal.children.len());
                for child in &internal.children {
                    children.push(Link::Disk(self.persist(store, child, written)?));
                }
                Arc::new(Node::Internal(InternalNode {
                    keys: internal.keys.clone(),
                    children,
                }))
            }
        };

        let extent = self.allocate(store, PageStore::pages_for(&clean))?;
        store.write_node(extent, clean)?;
        *written += 1;
        Ok(extent)
    }

    fn allocate(&mut self, store: &PageStore, pages: u32) -> Result<Extent> {
        let extent = self.allocator.allocate(pages);
        store.file().ensure_pages(self.allocator.total_pages())?;
        Ok(extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::btree::{TreeWriter, get};
    use crate::storage::file::DatabaseFile;
    use crate::storage::wal::MIN_WAL_CAPACITY;
    use tempfile::{TempDir, tempdir};

    fn setup() -> (TempDir, PageStore, WriterState, RwLock<TreeRegistry>) {
        let dir = tempdir().expect("create temp dir");
        let (file, superblock) =
            DatabaseFile::create(&dir.path().join("test.db"), MIN_WAL_CAPACITY).expect("create");
        let writer = WriterState {
            wal: Wal::new(
                superblock.log_offset(),
                superblock.log_capacity(),
                superblock.checkpoint_lsn,
                superblock.generation,
            ),
            allocator: ExtentAllocator::new(
                superblock.total_page_count,
                superblock.data_start_page(),
            ),
            superblock,
            next_txn_id: superblock.next_txn_id,
        };
        (
            dir,
            PageStore::new(file, 1 << 20),
            writer,
            RwLock::new(TreeRegistry::new()),
        )
    }

    fn insert_many(store: &PageStore, state: &RwLock<TreeRegistry>, count: u32) -> Vec<Extent> {
        let mut registry = state.write().expect("lock");
        let tree = registry.get_mut(0).expect("default tree");
        let mut writer = TreeWriter::new(store, tree.root.clone(), tree.len);
        for i in 0..count {
            writer
                .insert(Arc::from(&i.to_be_bytes()[..]), Arc::from(&[7u8; 64][..]))
                .expect("insert");
        }
        let (root, len, retired) = writer.finish();
        tree.root = root;
        tree.len = len;
        retired
    }

    #[test]
    fn test_checkpoint_writes_roots_and_superblock() {
        let (_dir, store, mut writer, state) = setup();
        insert_many(&store, &state, 1000);

        let stats = writer.checkpoint(&store, &state).expect("checkpoint");
        assert_eq!(stats.generation, 1);
        assert!(stats.nodes_written > 1);
        assert!(writer.superblock.catalog.is_some());
        assert_eq!(writer.wal.head(), 0);

        let registry = state.read().expect("lock");
        let tree = registry.get(0).expect("default tree");
        assert!(matches!(tree.root, Link::Disk(_)));
        let value = get(&store, &tree.root, &5u32.to_be_bytes()).expect("get");
        assert_eq!(value.as_deref(), Some(&[7u8; 64][..]));
    }

    #[test]
    fn test_clean_checkpoint_writes_no_nodes() {
        let (_dir, store, mut writer, state) = setup();
        insert_many(&store, &state, 10);
        writer.checkpoint(&store, &state).expect("first");

        let stats = writer.checkpoint(&store, &state).expect("second");
        assert_eq!(stats.nodes_written, 0);
        assert_eq!(stats.generation, 2);
    }

    #[test]
    fn test_retired_extents_are_reused_two_checkpoints_later() {
        let (_dir, store, mut writer, state) = setup();
        insert_many(&store, &state, 10);
        writer.checkpoint(&store, &state).expect("checkpoint");

        let retired = insert_many(&store, &state, 20);
        assert!(!retired.is_empty());
        store.reclaimer().retire(retired.iter().copied()).expect("retire");

        writer.checkpoint(&store, &state).expect("checkpoint");
        assert!(writer.allocator.is_allocated(retired[0].page));
        writer.checkpoint(&store, &state).expect("checkpoint");
        let stats = writer.checkpoint(&store, &state).expect("checkpoint");
        assert!(stats.extents_reclaimed >= retired.len());
    }
}

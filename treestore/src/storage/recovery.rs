//! Crash recovery for the storage engine.
//!
//! Recovery rebuilds the writer state from the newest valid superblock and
//! replays the log groups committed after its checkpoint.
//!
//! # Recovery Process
//!
//! 1. Load the catalog named by the superblock into a tree registry
//! 2. Rebuild the allocator from every extent reachable from the catalog
//! 3. Scan the log from the start of its region, keeping records whose LSN
//!    is at least the checkpoint LSN and strictly increasing
//! 4. Apply each group that reached its `Commit` record; discard the rest
//! 5. Position the log after the last committed group
//!
//! A live group tagged with a generation other than the superblock's was
//! written after a checkpoint whose slot is unreadable. Replaying it on top
//! of the older catalog would lose the checkpointed writes, so it is
//! reported as corruption.
//!
//! A damaged record at the tail of the log is a torn write and ends the scan.
//! A damaged record followed by live records is reported as corruption.

use crate::error::{Error, Result};
use crate::registry::TreeRegistry;
use crate::storage::allocator::ExtentAllocator;
use crate::storage::btree::{Link, TreeWriter, collect_extents};
use crate::storage::checkpoint::WriterState;
use crate::storage::page::PageType;
use crate::storage::store::PageStore;
use crate::storage::superblock::Superblock;
use crate::storage::wal::{LogRecordPayload, Lsn, TxnId, Wal};

/// Result of a recovery operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryResult {
    /// Number of live log records scanned.
    pub records_scanned: usize,

    /// Number of committed groups replayed.
    pub transactions_replayed: usize,

    /// Number of groups without a commit record.
    pub transactions_discarded: usize,

    /// Number of operations applied.
    pub operations_applied: usize,

    /// LSN the replay started from.
    pub checkpoint_lsn: Lsn,

    /// Highest LSN seen during recovery.
    pub recovered_lsn: Lsn,
}

/// Group being collected during replay.
struct PendingGroup {
    txn_id: TxnId,
    ops: Vec<LogRecordPayload>,
}

/// Rebuild the writer state and tree registry of an existing database.
pub fn recover(
    store: &PageStore,
    superblock: Superblock,
) -> Result<(WriterState, TreeRegistry, RecoveryResult)> {
    let mut registry = match superblock.catalog {
        Some(extent) => {
            let payload = store.read_blob(extent, PageType::Catalog)?;
            TreeRegistry::decode_catalog(&payload)?
        }
        None => TreeRegistry::new(),
    };

    let mut allocator =
        ExtentAllocator::new(superblock.total_page_count, superblock.data_start_page());
    if let Some(extent) = superblock.catalog {
        allocator.mark_used(extent);
    }
    let mut reachable = Vec::new();
    for (_, tree) in registry.iter() {
        collect_extents(store, &tree.root, &mut reachable)?;
    }
    for extent in reachable {
        allocator.mark_used(extent);
    }

    let checkpoint_lsn = superblock.checkpoint_lsn;
    let mut wal = Wal::new(
        superblock.log_offset(),
        superblock.log_capacity(),
        checkpoint_lsn,
        superblock.generation,
    );

    let mut result = RecoveryResult {
        checkpoint_lsn,
        recovered_lsn: checkpoint_lsn,
        ..RecoveryResult::default()
    };
    let mut pending: Option<PendingGroup> = None;
    let mut head = 0;
    let mut max_txn_id = 0;

    for entry in wal.replay(store.file(), checkpoint_lsn) {
        let (record, offset_after) = entry?;
        result.records_scanned += 1;
        result.recovered_lsn = result.recovered_lsn.max(record.lsn);
        max_txn_id = max_txn_id.max(record.txn_id);

        match record.payload {
            LogRecordPayload::Begin { generation } => {
                if generation != superblock.generation {
                    return Err(Error::Corruption(format!(
                        "log group at lsn {} belongs to checkpoint generation {generation}, \
                         but the newest readable superblock is generation {}",
                        record.lsn, superblock.generation
                    )));
                }
                if pending.is_some() {
                    result.transactions_discarded += 1;
                }
                pending = Some(PendingGroup {
                    txn_id: record.txn_id,
                    ops: Vec::new(),
                });
            }
            LogRecordPayload::Commit => {
                let group = pending
                    .take()
                    .filter(|group| group.txn_id == record.txn_id)
                    .ok_or_else(|| {
                        Error::Corruption(format!(
                            "commit without begin for txn {} at lsn {}",
                            record.txn_id, record.lsn
                        ))
                    })?;
                for op in group.ops {
                    apply(store, &mut registry, op)?;
                    result.operations_applied += 1;
                }
                result.transactions_replayed += 1;
                head = offset_after;
            }
            op => match pending.as_mut() {
                Some(group) if group.txn_id == record.txn_id => group.ops.push(op),
                _ => {
                    return Err(Error::Corruption(format!(
                        "log record at lsn {} outside its group",
                        record.lsn
                    )));
                }
            },
        }
    }
    if pending.is_some() {
        result.transactions_discarded += 1;
    }

    // Burned LSNs past the last commit are never handed out again.
    wal.resume(head, result.recovered_lsn + 1);

    let writer = WriterState {
        wal,
        allocator,
        superblock,
        next_txn_id: superblock.next_txn_id.max(max_txn_id + 1),
    };
    Ok((writer, registry, result))
}

/// Apply one logged operation to the registry.
fn apply(store: &PageStore, registry: &mut TreeRegistry, op: LogRecordPayload) -> Result<()> {
    let tree_id = match &op {
        LogRecordPayload::CreateTree { tree_id, name } => {
            if registry.lookup(name).is_some() || registry.get(*tree_id).is_some() {
                return Err(Error::Corruption(format!(
                    "log creates tree {tree_id} which already exists"
                )));
            }
            #[allow(clippy::disallowed_methods)] // Arc::clone of the logged name
            registry.insert(*tree_id, std::sync::Arc::clone(name), Link::empty(), 0);
            return Ok(());
        }
        LogRecordPayload::DropTree { tree_id } => {
            let tree = registry
                .remove(*tree_id)
                .ok_or_else(|| unknown_tree(*tree_id))?;
            let mut extents = Vec::new();
            collect_extents(store, &tree.root, &mut extents)?;
            store.reclaimer().retire(extents)?;
            return Ok(());
        }
        LogRecordPayload::Insert { tree_id, .. }
        | LogRecordPayload::Remove { tree_id, .. }
        | LogRecordPayload::Clear { tree_id } => *tree_id,
        LogRecordPayload::Begin { .. } | LogRecordPayload::Commit => return Ok(()),
    };

    let tree = registry
        .get_mut(tree_id)
        .ok_or_else(|| unknown_tree(tree_id))?;
    let mut writer = TreeWriter::new(store, tree.root.clone(), tree.len);
    match op {
        LogRecordPayload::Insert { key, value, .. } => {
            writer.insert(key, value)?;
        }
        LogRecordPayload::Remove { key, .. } => {
            writer.remove(&key)?;
        }
        LogRecordPayload::Clear { .. } => writer.clear()?,
        _ => {}
    }

    let (root, len, retired) = writer.finish();
    tree.root = root;
    tree.len = len;
    store.reclaimer().retire(retired)
}

fn unknown_tree(tree_id: u64) -> Error {
    Error::Corruption(format!("log references unknown tree {tree_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DEFAULT_TREE_ID;
    use crate::storage::btree::get;
    use crate::storage::file::DatabaseFile;
    use crate::storage::wal::MIN_WAL_CAPACITY;
    use std::sync::{Arc, RwLock};
    use tempfile::{TempDir, tempdir};

    fn bytes(b: &[u8]) -> crate::storage::Bytes {
        Arc::from(b)
    }

    /// A freshly created database with its first checkpoint written.
    fn create() -> (TempDir, PageStore, WriterState, RwLock<TreeRegistry>) {
        let dir = tempdir().expect("create temp dir");
        let (file, superblock) =
            DatabaseFile::create(&dir.path().join("test.db"), MIN_WAL_CAPACITY).expect("create");
        let store = PageStore::new(file, 1 << 20);
        let (mut writer, registry, _) = recover(&store, superblock).expect("recover");
        let state = RwLock::new(registry);
        writer.checkpoint(&store, &state).expect("checkpoint");
        (dir, store, writer, state)
    }

    fn insert(key: &[u8], value: &[u8]) -> LogRecordPayload {
        LogRecordPayload::Insert {
            tree_id: DEFAULT_TREE_ID,
            key: bytes(key),
            value: bytes(value),
        }
    }

    #[test]
    fn test_replays_committed_groups() {
        let (_dir, store, mut writer, _state) = create();
        writer
            .append(&store, &[insert(b"a", b"1"), insert(b"b", b"2")])
            .expect("append");
        writer.append(&store, &[insert(b"a", b"3")]).expect("append");

        let (recovered, registry, result) = recover(&store, writer.superblock).expect("recover");
        assert_eq!(result.transactions_replayed, 2);
        assert_eq!(result.operations_applied, 3);
        assert_eq!(recovered.wal.head(), writer.wal.head());
        assert!(recovered.wal.next_lsn() >= writer.wal.next_lsn());

        let tree = registry.get(DEFAULT_TREE_ID).expect("default tree");
        assert_eq!(tree.len, 2);
        let value = get(&store, &tree.root, b"a").expect("get");
        assert_eq!(value.as_deref(), Some(&b"3"[..]));
    }

    #[test]
    fn test_torn_group_is_discarded() {
        let (_dir, store, mut writer, _state) = create();
        writer.append(&store, &[insert(b"a", b"1")]).expect("append");
        let committed_head = writer.wal.head();

        // Only the Begin record of the second group reaches the disk.
        store.file().faults().tear_next_write(33);
        writer
            .append(&store, &[insert(b"b", b"2")])
            .expect_err("torn write fails");

        let (recovered, registry, result) = recover(&store, writer.superblock).expect("recover");
        assert_eq!(result.transactions_replayed, 1);
        assert_eq!(recovered.wal.head(), committed_head);
        let tree = registry.get(DEFAULT_TREE_ID).expect("default tree");
        assert!(get(&store, &tree.root, b"b").expect("get").is_none());
    }

    #[test]
    fn test_tree_lifecycle_is_replayed() {
        let (_dir, store, mut writer, _state) = create();
        writer
            .append(
                &store,
                &[LogRecordPayload::CreateTree {
                    tree_id: 1,
                    name: bytes(b"users"),
                }],
            )
            .expect("append");
        writer
            .append(
                &store,
                &[LogRecordPayload::Insert {
                    tree_id: 1,
                    key: bytes(b"k"),
                    value: bytes(b"v"),
                }],
            )
            .expect("append");
        writer
            .append(&store, &[LogRecordPayload::DropTree { tree_id: 1 }])
            .expect("append");

        let (_, registry, _) = recover(&store, writer.superblock).expect("recover");
        assert_eq!(registry.lookup(b"users"), None);
        assert_eq!(registry.next_id(), 2);
    }

    #[test]
    fn test_log_from_newer_generation_is_corruption() {
        let (_dir, store, mut writer, _state) = create();
        writer.append(&store, &[insert(b"a", b"1")]).expect("append");

        // An older slot that shares the checkpoint LSN but not the cycle.
        let mut older = writer.superblock;
        older.generation -= 1;
        let result = recover(&store, older);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_unknown_tree_is_corruption() {
        let (_dir, store, mut writer, _state) = create();
        writer
            .append(&store, &[LogRecordPayload::Clear { tree_id: 42 }])
            .expect("append");

        let result = recover(&store, writer.superblock);
        assert!(matches!(result, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_checkpointed_extents_are_marked_used() {
        let (_dir, store, mut writer, state) = create();
        writer
            .append(&store, &[insert(b"a", b"1")])
            .expect("append");
        {
            let mut registry = state.write().expect("lock");
            let tree = registry.get_mut(DEFAULT_TREE_ID).expect("default tree");
            let mut tree_writer = TreeWriter::new(&store, tree.root.clone(), tree.len);
            tree_writer.insert(bytes(b"a"), bytes(b"1")).expect("insert");
            let (root, len, _) = tree_writer.finish();
            tree.root = root;
            tree.len = len;
        }
        writer.checkpoint(&store, &state).expect("checkpoint");

        let (recovered, registry, result) = recover(&store, writer.superblock).expect("recover");
        assert_eq!(result.records_scanned, 0);
        let root = registry
            .get(DEFAULT_TREE_ID)
            .and_then(|tree| tree.root.extent())
            .expect("root on disk");
        assert!(recovered.allocator.is_allocated(root.page));
        let catalog = writer.superblock.catalog.expect("catalog");
        assert!(recovered.allocator.is_allocated(catalog.page));
    }
}

//! Database handle.
//!
//! # Thread Safety
//!
//! - A `Mutex<WriterState>` serializes every mutation, tree lifecycle change,
//!   flush and checkpoint. It is always taken before the state lock.
//! - An `RwLock<TreeRegistry>` guards the published roots. Readers hold it
//!   only long enough to clone a root and pin the reclamation epoch, then walk
//!   immutable nodes without any lock.
//!
//! # Invariants
//!
//! - A root is published only after its log group was written
//! - A failed mutation publishes nothing and retires nothing
//! - The default tree always exists

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::flusher;
use crate::registry::{DEFAULT_TREE_ID, DEFAULT_TREE_NAME, TreeRegistry};
use crate::storage::btree::{Link, TreeWriter, collect_extents};
use crate::storage::checkpoint::{CheckpointStats, WriterState};
use crate::storage::file::DatabaseFile;
use crate::storage::reclaim::EpochPin;
use crate::storage::recovery::{RecoveryResult, recover};
use crate::storage::store::PageStore;
use crate::storage::wal::{LogRecordPayload, Wal};
use crate::storage::{Bytes, TreeId};
use crate::tree::Tree;

/// Shared state behind every `Db` and `Tree` handle.
pub(crate) struct Inner {
    path: PathBuf,
    pub(crate) store: PageStore,
    writer: Mutex<WriterState>,
    state: RwLock<TreeRegistry>,
    recovered: bool,
}

/// A consistent view of one tree at a point in time.
pub(crate) struct Snapshot {
    pub root: Link,
    pub pin: EpochPin,
}

/// An open database.
///
/// Cloning is cheap and every clone refers to the same database. A `Db`
/// dereferences to its default tree.
#[derive(Clone)]
#[allow(clippy::disallowed_methods)] // Clone shares the Arc
pub struct Db {
    inner: Arc<Inner>,
    default: Tree,
}

impl Db {
    /// Open or create the database at `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] with `NotFound` if the path is missing and
    ///   `create_if_missing` is off, or if the file cannot be accessed
    /// - [`Error::Open`] if the file is not a database of this format
    /// - [`Error::Corruption`] if recovery finds damaged data
    #[allow(clippy::disallowed_methods)] // Arc::clone hands the default tree its reference
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        let path = path.as_ref();
        let exists = path.try_exists()?;
        if !exists && !config.create_if_missing {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no database at {}", path.display()),
            )));
        }

        let (file, superblock) = if exists {
            DatabaseFile::open(path)?
        } else {
            DatabaseFile::create(path, config.log_capacity_bytes)?
        };
        let store = PageStore::new(file, config.cache_size_bytes);
        let (mut writer, registry, recovery) = recover(&store, superblock)?;
        let state = RwLock::new(registry);

        // A new file gets its catalog right away so that every later open
        // starts from a checkpoint.
        if writer.superblock.catalog.is_none() {
            writer.checkpoint(&store, &state)?;
        }

        log_open(path, exists, &recovery);

        let inner = Arc::new(Inner {
            path: path.to_path_buf(),
            store,
            writer: Mutex::new(writer),
            state,
            recovered: exists,
        });

        if let Some(ms) = config.flush_every_ms {
            flusher::spawn(Arc::downgrade(&inner), Duration::from_millis(ms));
        }

        let default = Tree::new(
            Arc::clone(&inner),
            DEFAULT_TREE_ID,
            Bytes::from(DEFAULT_TREE_NAME),
        );
        Ok(Self { inner, default })
    }

    /// Open the tree called `name`, creating it if it does not exist.
    ///
    /// Concurrent calls for the same new name create exactly one tree.
    #[allow(clippy::disallowed_methods)] // Arc::clone for the new handle
    pub fn open_tree(&self, name: impl AsRef<[u8]>) -> Result<Tree> {
        let name = name.as_ref();
        let id = self.inner.open_or_create(name)?;
        Ok(Tree::new(Arc::clone(&self.inner), id, Bytes::from(name)))
    }

    /// Drop the tree called `name` and every entry in it.
    ///
    /// Returns `false` if no such tree exists. Handles to the dropped tree
    /// keep their name but fail with [`Error::TreeDropped`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] for the default tree.
    pub fn drop_tree(&self, name: impl AsRef<[u8]>) -> Result<bool> {
        self.inner.drop_tree(name.as_ref())
    }

    /// Names of all trees, including the default tree.
    pub fn tree_names(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.inner.read_state()?.names())
    }

    /// Make every committed mutation durable.
    ///
    /// Returns the number of log bytes synced by this call.
    pub fn flush(&self) -> Result<usize> {
        self.inner.flush()
    }

    /// Write every dirty node to the page store and empty the log.
    pub fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint().map(|_| ())
    }

    /// Checkpoint and release this handle.
    ///
    /// The file is closed once the last handle to the database is dropped.
    pub fn close(self) -> Result<()> {
        self.inner.checkpoint()?;
        tracing::debug!(path = %self.inner.path.display(), "database closed");
        Ok(())
    }

    /// Current size of the database file in bytes.
    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.inner.store.file().len()?)
    }

    /// Whether the database existed before this open.
    #[must_use]
    pub fn was_recovered(&self) -> bool {
        self.inner.recovered
    }

    #[cfg(test)]
    pub(crate) const fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }
}

impl Deref for Db {
    type Target = Tree;

    fn deref(&self) -> &Tree {
        &self.default
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.inner.path)
            .finish_non_exhaustive()
    }
}

fn log_open(path: &Path, existed: bool, recovery: &RecoveryResult) {
    tracing::info!(
        path = %path.display(),
        existed,
        records_scanned = recovery.records_scanned,
        transactions_replayed = recovery.transactions_replayed,
        transactions_discarded = recovery.transactions_discarded,
        operations_applied = recovery.operations_applied,
        "database opened"
    );
    if recovery.transactions_discarded > 0 {
        tracing::warn!(
            path = %path.display(),
            discarded = recovery.transactions_discarded,
            "discarded uncommitted log groups"
        );
    }
}

impl Inner {
    fn lock_writer(&self) -> Result<MutexGuard<'_, WriterState>> {
        self.writer.lock().map_err(|_| Error::LockPoisoned)
    }

    pub(crate) fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, TreeRegistry>> {
        self.state.read().map_err(|_| Error::LockPoisoned)
    }

    /// Whether the tree with `id` is still registered.
    pub(crate) fn tree_exists(&self, id: TreeId) -> bool {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(id)
            .is_some()
    }

    /// Clone the root of a tree and pin it against reclamation.
    pub(crate) fn snapshot(&self, id: TreeId, name: &[u8]) -> Result<Snapshot> {
        let state = self.read_state()?;
        let tree = state.get(id).ok_or_else(|| dropped(name))?;
        Ok(Snapshot {
            root: tree.root.clone(),
            pin: self.store.reclaimer().pin()?,
        })
    }

    /// Run one logged mutation against a tree.
    ///
    /// `op` works on a private copy of the tree and returns its result along
    /// with whether anything changed. Only changed trees are logged and
    /// published, and `ops` must describe exactly what `op` did.
    pub(crate) fn mutate<R>(
        &self,
        id: TreeId,
        name: &[u8],
        ops: &[LogRecordPayload],
        op: impl FnOnce(&mut TreeWriter<'_>) -> Result<(R, bool)>,
    ) -> Result<R> {
        let mut writer = self.lock_writer()?;
        self.reserve_log(&mut writer, ops)?;

        let (root, len) = {
            let state = self.read_state()?;
            let tree = state.get(id).ok_or_else(|| dropped(name))?;
            (tree.root.clone(), tree.len)
        };

        let mut working = TreeWriter::new(&self.store, root, len);
        let (result, changed) = op(&mut working)?;
        if !changed {
            return Ok(result);
        }

        writer.append(&self.store, ops)?;
        let (root, len, retired) = working.finish();
        {
            let mut state = self.state.write().map_err(|_| Error::LockPoisoned)?;
            if let Some(tree) = state.get_mut(id) {
                tree.root = root;
                tree.len = len;
            }
        }
        self.store.reclaimer().retire(retired)?;

        self.after_append(&mut writer);
        Ok(result)
    }

    fn open_or_create(&self, name: &[u8]) -> Result<TreeId> {
        if let Some(id) = self.read_state()?.lookup(name) {
            return Ok(id);
        }

        let mut writer = self.lock_writer()?;
        // Another thread may have created it while we waited for the writer.
        if let Some(id) = self.read_state()?.lookup(name) {
            return Ok(id);
        }

        let name = Bytes::from(name);
        #[allow(clippy::disallowed_methods)] // Arc::clone shares the name with the log record
        let ops = [LogRecordPayload::CreateTree {
            tree_id: self.read_state()?.next_id(),
            name: Arc::clone(&name),
        }];
        self.reserve_log(&mut writer, &ops)?;
        writer.append(&self.store, &ops)?;

        let id = self
            .state
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .create(name);
        tracing::debug!(tree_id = id, "tree created");

        self.after_append(&mut writer);
        Ok(id)
    }

    fn drop_tree(&self, name: &[u8]) -> Result<bool> {
        if name == DEFAULT_TREE_NAME {
            return Err(Error::Unsupported("the default tree cannot be dropped"));
        }

        let mut writer = self.lock_writer()?;
        let Some((id, root)) = ({
            let state = self.read_state()?;
            state
                .lookup(name)
                .and_then(|id| state.get(id).map(|tree| (id, tree.root.clone())))
        }) else {
            return Ok(false);
        };

        let mut extents = Vec::new();
        collect_extents(&self.store, &root, &mut extents)?;

        let ops = [LogRecordPayload::DropTree { tree_id: id }];
        self.reserve_log(&mut writer, &ops)?;
        writer.append(&self.store, &ops)?;

        self.state
            .write()
            .map_err(|_| Error::LockPoisoned)?
            .remove(id);
        self.store.reclaimer().retire(extents)?;
        tracing::debug!(tree_id = id, "tree dropped");

        self.after_append(&mut writer);
        Ok(true)
    }

    pub(crate) fn flush(&self) -> Result<usize> {
        let mut writer = self.lock_writer()?;
        let bytes = writer.wal.flush(self.store.file())?;
        Ok(usize::try_from(bytes).unwrap_or(usize::MAX))
    }

    fn checkpoint(&self) -> Result<CheckpointStats> {
        let mut writer = self.lock_writer()?;
        writer.checkpoint(&self.store, &self.state)
    }

    /// Make room in the log for a group of `ops`, checkpointing if needed.
    fn reserve_log(&self, writer: &mut WriterState, ops: &[LogRecordPayload]) -> Result<()> {
        let size = Wal::group_size(ops);
        if size > writer.wal.capacity() {
            return Err(Error::RecordTooLarge {
                size,
                capacity: writer.wal.capacity(),
            });
        }
        if !writer.log_fits(size) {
            writer.checkpoint(&self.store, &self.state)?;
        }
        Ok(())
    }

    /// Checkpoint once the log is half full. The mutation already committed,
    /// so a failure here is only logged.
    fn after_append(&self, writer: &mut WriterState) {
        if writer.log_half_full()
            && let Err(e) = writer.checkpoint(&self.store, &self.state)
        {
            tracing::warn!(error = %e, "automatic checkpoint failed");
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let writer = match self.writer.get_mut() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.wal.flush(self.store.file()) {
            tracing::error!(path = %self.path.display(), error = %e, "final log flush failed");
        }
    }
}

fn dropped(name: &[u8]) -> Error {
    Error::TreeDropped {
        name: name.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_config;
    use tempfile::tempdir;

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempdir().expect("create temp dir");
        let result = Db::open(
            dir.path().join("missing.db"),
            test_config().create_if_missing(false),
        );
        let Err(Error::Io(e)) = result else {
            panic!("expected io error");
        };
        assert_eq!(e.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_open_foreign_file_fails() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("foreign.db");
        std::fs::write(&path, vec![0xAB; 64 * 1024]).expect("write");

        assert!(matches!(Db::open(&path, test_config()), Err(Error::Open(_))));
    }

    #[test]
    fn test_open_short_file_fails() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("short.db");
        std::fs::write(&path, b"not a database").expect("write");

        assert!(matches!(Db::open(&path, test_config()), Err(Error::Open(_))));
    }

    #[test]
    fn test_new_database_is_checkpointed() {
        let dir = tempdir().expect("create temp dir");
        let db = Db::open(dir.path().join("test.db"), test_config()).expect("open");
        assert!(!db.was_recovered());

        let writer = db.inner().writer.lock().expect("lock");
        assert_eq!(writer.superblock.generation, 1);
        assert!(writer.superblock.catalog.is_some());
    }

    #[test]
    fn test_failed_append_publishes_nothing() {
        let dir = tempdir().expect("create temp dir");
        let db = Db::open(dir.path().join("test.db"), test_config()).expect("open");
        db.insert(b"a", b"1").expect("insert");
        db.checkpoint().expect("checkpoint");
        let pending = db.store_pending_retired();

        db.inner().store.file().faults().fail_next_write();
        assert!(matches!(db.insert(b"b", b"2"), Err(Error::Io(_))));

        assert_eq!(db.len().expect("len"), 1);
        assert!(db.get(b"b").expect("get").is_none());
        assert_eq!(db.store_pending_retired(), pending);

        db.insert(b"c", b"3").expect("insert after failure");
        assert_eq!(db.len().expect("len"), 2);
    }

    #[test]
    fn test_group_larger_than_log_is_rejected() {
        let dir = tempdir().expect("create temp dir");
        let db = Db::open(dir.path().join("test.db"), test_config()).expect("open");

        let value = vec![0u8; 2 * 1024 * 1024];
        let result = db.insert(b"big", &value);
        assert!(matches!(result, Err(Error::RecordTooLarge { .. })));
        assert!(db.is_empty().expect("is_empty"));
    }

    #[test]
    fn test_log_wraps_through_checkpoints() {
        let dir = tempdir().expect("create temp dir");
        let path = dir.path().join("test.db");
        let db = Db::open(&path, test_config()).expect("open");

        // About 4 MiB of log traffic through a 1 MiB log.
        let value = vec![9u8; 4000];
        for i in 0..1000u32 {
            db.insert(format!("key{:03}", i % 300), &value).expect("insert");
        }
        assert_eq!(db.len().expect("len"), 300);
        let generation = db.inner().writer.lock().expect("lock").superblock.generation;
        assert!(generation > 3);

        drop(db);
        let db = Db::open(&path, test_config()).expect("reopen");
        assert_eq!(db.len().expect("len"), 300);
        assert_eq!(db.get(b"key299").expect("get"), Some(value));
    }

    impl Db {
        fn store_pending_retired(&self) -> usize {
            self.inner.store.reclaimer().pending()
        }
    }
}

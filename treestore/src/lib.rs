//! An embedded, ordered key-value store.
//!
//! A database is one file holding any number of named trees. Each tree maps
//! byte-string keys to byte-string values in ascending key order.
//!
//! Life of a write:
//! 1. The tree handle builds a private copy-on-write path to the new root
//! 2. The change is appended to the log as one `Begin, ops.., Commit` group
//! 3. The new root is published; readers pick it up on their next call
//! 4. A later flush (explicit or background) makes the group durable
//! 5. A checkpoint writes dirty nodes to disk and empties the log
//!
//! ```no_run
//! let db = treestore::open("my.db")?;
//! db.insert(b"alice", b"10")?;
//!
//! let users = db.open_tree(b"users")?;
//! let mut batch = treestore::Batch::default();
//! batch.insert(b"bob", b"20");
//! batch.insert(b"carol", b"30");
//! users.apply_batch(batch)?;
//!
//! for entry in users.iter()? {
//!     let (key, value) = entry?;
//!     println!("{key:?} = {value:?}");
//! }
//! db.close()?;
//! # Ok::<(), treestore::Error>(())
//! ```

#![cfg_attr(
    test,
    allow(
        clippy::disallowed_methods,
        clippy::expect_used,
        clippy::unwrap_used
    )
)]

mod batch;
mod config;
mod db;
mod error;
mod flusher;
mod iter;
mod registry;
mod storage;
mod tree;

#[cfg(test)]
mod testing;

mod e2e_tests;

use std::path::Path;

pub use batch::Batch;
pub use config::{Config, ConfigError};
pub use db::Db;
pub use error::{CompareAndSwapError, Error, Result};
pub use iter::Iter;
pub use registry::DEFAULT_TREE_NAME;
pub use tree::{Tree, TreeState};

/// Open the database at `path` with the default [`Config`].
pub fn open(path: impl AsRef<Path>) -> Result<Db> {
    Config::default().open(path)
}

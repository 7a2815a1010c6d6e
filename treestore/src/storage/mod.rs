//! Single-file storage engine.
//!
//! # File Format
//!
//! The database is stored in a single file of 8KB pages:
//!
//! - Pages 0 and 1: superblock slots, written alternately by checkpoints
//! - Pages 2 to 2 + L: the write-ahead log region
//! - Remaining pages: node and catalog extents
//!
//! # Durability
//!
//! Every mutation is appended to the log as one `Begin, ops.., Commit` group
//! before it becomes visible. A checkpoint writes all dirty nodes to fresh
//! extents, then a catalog of tree roots, then the next superblock slot, and
//! finally empties the log. Recovery loads the newest valid superblock and
//! replays the committed groups that follow its checkpoint LSN.

use std::sync::Arc;

pub(crate) mod allocator;
pub(crate) mod btree;
pub(crate) mod cache;
pub(crate) mod checkpoint;
pub(crate) mod file;
pub(crate) mod page;
pub(crate) mod reclaim;
pub(crate) mod recovery;
pub(crate) mod store;
pub(crate) mod superblock;
pub(crate) mod wal;

/// Shared immutable byte string used for keys and values inside the engine.
pub type Bytes = Arc<[u8]>;

/// Stable identifier of a named tree. The default tree is always 0.
pub type TreeId = u64;

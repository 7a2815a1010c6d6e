//! Copy-on-write B+tree shared by every named tree.
//!
//! # Structure
//!
//! - Leaf nodes hold sorted key/value entries
//! - Internal nodes hold separator keys and links to their children
//!
//! Keys and values are arbitrary byte strings. A node that does not fit in one
//! page is split; a single entry larger than a page gets a multi-page extent.

mod node;
mod tree;

#[cfg(test)]
pub use node::LeafNode;
pub use node::{InternalNode, Link, Node, NodeError};
pub use tree::{TreeWriter, collect_extents, get};

//! B-tree node structures and serialization.
//!
//! Nodes are immutable once shared. Writers copy the nodes on the path they
//! change and link the copies together with [`Link::Mem`]; a checkpoint later
//! replaces those links with [`Link::Disk`] extents.
//!
//! # Leaf Payload
//!
//! ```text
//! entry_count (4) | { key_len (4) | key | value_len (4) | value }*
//! ```
//!
//! # Internal Payload
//!
//! ```text
//! key_count (4) | { key_len (4) | key }* | { child_page (8) | child_pages (4) }*
//! ```
//!
//! An internal node with `n` keys has `n + 1` children. Child `i` holds keys
//! `< keys[i]`, child `i + 1` holds keys `>= keys[i]`.

// Entry counts fit in u32.
#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;

use crate::storage::Bytes;
use crate::storage::page::{ByteReader, Extent, PageType, write_prefixed};

/// Reference from a parent (or tree root) to a node.
#[derive(Debug, Clone)]
#[allow(clippy::disallowed_methods)] // Clone bumps an Arc or copies an extent
pub enum Link {
    /// Node modified since the last checkpoint.
    Mem(Arc<Node>),
    /// Node stored on disk.
    Disk(Extent),
}

impl Link {
    /// A link to a new empty leaf.
    #[must_use]
    pub fn empty() -> Self {
        Self::Mem(Arc::new(Node::Leaf(LeafNode::default())))
    }

    /// The extent this link points at, if it is clean.
    #[must_use]
    pub const fn extent(&self) -> Option<Extent> {
        match self {
            Self::Disk(extent) => Some(*extent),
            Self::Mem(_) => None,
        }
    }
}

/// A B-tree node.
#[derive(Debug, Clone)]
#[allow(clippy::disallowed_methods)] // Clone is the copy half of copy-on-write
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// Sorted key/value entries.
#[derive(Debug, Clone, Default)]
#[allow(clippy::disallowed_methods)]
pub struct LeafNode {
    pub entries: Vec<(Bytes, Bytes)>,
}

/// Separator keys and child links.
#[derive(Debug, Clone)]
#[allow(clippy::disallowed_methods)]
pub struct InternalNode {
    pub keys: Vec<Bytes>,
    pub children: Vec<Link>,
}

impl Node {
    /// Page type used when this node is written.
    #[must_use]
    pub const fn page_type(&self) -> PageType {
        match self {
            Self::Leaf(_) => PageType::BTreeLeaf,
            Self::Internal(_) => PageType::BTreeInternal,
        }
    }

    /// Serialized payload size in bytes.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        match self {
            Self::Leaf(leaf) => leaf.encoded_size(),
            Self::Internal(internal) => internal.encoded_size(),
        }
    }

    /// Serialize the node payload.
    ///
    /// Internal nodes can only be written once every child is on disk.
    pub fn encode(&self) -> Result<Vec<u8>, NodeError> {
        let mut buf = Vec::with_capacity(self.encoded_size());
        match self {
            Self::Leaf(leaf) => {
                buf.extend_from_slice(&(leaf.entries.len() as u32).to_le_bytes());
                for (key, value) in &leaf.entries {
                    write_prefixed(&mut buf, key);
                    write_prefixed(&mut buf, value);
                }
            }
            Self::Internal(internal) => {
                buf.extend_from_slice(&(internal.keys.len() as u32).to_le_bytes());
                for key in &internal.keys {
                    write_prefixed(&mut buf, key);
                }
                for child in &internal.children {
                    let extent = child.extent().ok_or(NodeError::DirtyChild)?;
                    buf.extend_from_slice(&extent.page.to_le_bytes());
                    buf.extend_from_slice(&extent.pages.to_le_bytes());
                }
            }
        }
        Ok(buf)
    }

    /// Deserialize a node payload.
    pub fn decode(page_type: PageType, payload: &[u8]) -> Result<Self, NodeError> {
        let mut reader = ByteReader::new(payload);
        let count = reader.read_u32().ok_or(NodeError::Truncated)? as usize;

        let node = match page_type {
            PageType::BTreeLeaf => {
                let mut entries = Vec::with_capacity(count.min(payload.len() / 8));
                for _ in 0..count {
                    let key = reader.read_prefixed().ok_or(NodeError::Truncated)?;
                    let value = reader.read_prefixed().ok_or(NodeError::Truncated)?;
                    entries.push((Arc::from(key), Arc::from(value)));
                }
                Self::Leaf(LeafNode { entries })
            }
            PageType::BTreeInternal => {
                let mut keys = Vec::with_capacity(count.min(payload.len() / 4));
                for _ in 0..count {
                    let key = reader.read_prefixed().ok_or(NodeError::Truncated)?;
                    keys.push(Arc::from(key));
                }
                let mut children = Vec::with_capacity(count + 1);
                for _ in 0..=count {
                    let page = reader.read_u64().ok_or(NodeError::Truncated)?;
                    let pages = reader.read_u32().ok_or(NodeError::Truncated)?;
                    children.push(Link::Disk(Extent::new(page, pages)));
                }
                Self::Internal(InternalNode { keys, children })
            }
            other => return Err(NodeError::UnexpectedPageType(other)),
        };

        if reader.remaining() != 0 {
            return Err(NodeError::TrailingBytes(reader.remaining()));
        }
        Ok(node)
    }
}

impl LeafNode {
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|(k, v)| 8 + k.len() + v.len())
            .sum::<usize>()
    }

    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_ref().cmp(key))
    }

    /// Split in half by entry count.
    ///
    /// Returns the left half, the first key of the right half, and the right half.
    #[must_use]
    pub fn split(mut self) -> (Self, Bytes, Self) {
        let right = self.entries.split_off(self.entries.len() / 2);
        let separator = Arc::clone(&right[0].0);
        (self, separator, Self { entries: right })
    }
}

impl InternalNode {
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        4 + self.keys.iter().map(|k| 4 + k.len()).sum::<usize>() + self.children.len() * 12
    }

    /// Index of the child whose subtree may contain `key`.
    #[must_use]
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|k| k.as_ref().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    /// Split around the middle key, which moves up to the parent.
    #[must_use]
    pub fn split(mut self) -> (Self, Bytes, Self) {
        let mid = self.keys.len() / 2;
        let right_keys = self.keys.split_off(mid + 1);
        let right_children = self.children.split_off(mid + 1);
        let separator = self.keys.pop().unwrap_or_default();
        (
            self,
            separator,
            Self {
                keys: right_keys,
                children: right_children,
            },
        )
    }
}

/// Errors from decoding or encoding nodes.
#[derive(Debug)]
pub enum NodeError {
    /// Payload ended early.
    Truncated,
    /// Payload has bytes past the last field.
    TrailingBytes(usize),
    /// Extent holds something other than a node.
    UnexpectedPageType(PageType),
    /// Internal node encoded before its children were written.
    DirtyChild,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "node payload truncated"),
            Self::TrailingBytes(n) => write!(f, "node payload has {n} trailing bytes"),
            Self::UnexpectedPageType(t) => write!(f, "expected a node page, found {t:?}"),
            Self::DirtyChild => write!(f, "internal node has an unwritten child"),
        }
    }
}

impl std::error::Error for NodeError {}

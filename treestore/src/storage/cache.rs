//! Node cache.
//!
//! Holds decoded nodes keyed by the first page of their extent. Entries are
//! weighted by their encoded size and evicted least-recently-used first once
//! the total weight exceeds the configured budget.
//!
//! # Invariants
//!
//! - `used` equals the sum of the weights of all cached entries
//! - every cached page appears exactly once in `recency`

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use crate::storage::btree::Node;
use crate::storage::page::PageId;

struct CacheEntry {
    node: Arc<Node>,
    weight: usize,
    tick: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<PageId, CacheEntry>,
    /// Access tick to page, oldest first.
    recency: BTreeMap<u64, PageId>,
    used: usize,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub hits: u64,
    pub misses: u64,
}

/// LRU cache of decoded nodes bounded by bytes.
pub struct NodeCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl NodeCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Look up a node and mark it recently used.
    pub fn get(&self, page: PageId) -> Option<Arc<Node>> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;

        let Some(entry) = inner.entries.get_mut(&page) else {
            inner.misses += 1;
            return None;
        };
        let old_tick = std::mem::replace(&mut entry.tick, tick);
        #[allow(clippy::disallowed_methods)] // Arc::clone hands out a shared node
        let node = Arc::clone(&entry.node);

        inner.recency.remove(&old_tick);
        inner.recency.insert(tick, page);
        inner.hits += 1;
        Some(node)
    }

    /// Insert or replace the node cached for `page`, evicting as needed.
    ///
    /// The newly inserted node is never evicted by its own insertion, so a
    /// node larger than the whole budget still gets cached until the next insert.
    pub fn insert(&self, page: PageId, node: Arc<Node>, weight: usize) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.tick += 1;
        let tick = inner.tick;

        if let Some(old) = inner.entries.insert(page, CacheEntry { node, weight, tick }) {
            inner.recency.remove(&old.tick);
            inner.used -= old.weight;
        }
        inner.recency.insert(tick, page);
        inner.used += weight;

        while inner.used > self.capacity {
            let Some((&oldest, &victim)) = inner.recency.iter().next() else {
                break;
            };
            if victim == page {
                break;
            }
            inner.recency.remove(&oldest);
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.used -= evicted.weight;
            }
        }
    }

    /// Drop the cached node for `page`, if any.
    pub fn remove(&self, page: PageId) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if let Some(old) = inner.entries.remove(&page) {
            inner.recency.remove(&old.tick);
            inner.used -= old.weight;
        }
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|inner| CacheStats {
                entries: inner.entries.len(),
                used_bytes: inner.used,
                hits: inner.hits,
                misses: inner.misses,
            })
            .unwrap_or_default()
    }
}

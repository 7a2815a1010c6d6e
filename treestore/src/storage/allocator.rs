//! Extent allocator using an in-memory bitmap of used pages.
//!
//! The bitmap is never persisted. On open it is rebuilt from the fixed regions
//! and every extent reachable from the checkpointed catalog; everything else in
//! the file is free.

// Page IDs are u64 but bitmap indices are usize. Files with more than 2^32
// pages are not a practical concern on 32-bit targets.
#![allow(clippy::cast_possible_truncation)]

use crate::storage::page::{Extent, PageId};

const BITS_PER_BYTE: usize = 8;

/// Tracks which pages of the data region are in use.
#[derive(Debug)]
pub struct ExtentAllocator {
    bitmap: Vec<u8>,
    /// Pages tracked; the file is grown to match.
    total_pages: u64,
    /// No free run starts before this page.
    search_hint: u64,
}

impl ExtentAllocator {
    /// Create an allocator for a file of `total_pages` pages whose first
    /// `reserved` pages (superblock slots and log) are never handed out.
    #[must_use]
    pub fn new(total_pages: u64, reserved: u64) -> Self {
        let total_pages = total_pages.max(reserved);
        let mut bitmap = vec![0u8; (total_pages as usize).div_ceil(BITS_PER_BYTE)];
        for page in 0..reserved {
            set_bit(&mut bitmap, page as usize);
        }

        Self {
            bitmap,
            total_pages,
            search_hint: reserved,
        }
    }

    /// Mark an extent found during recovery as used, growing if needed.
    pub fn mark_used(&mut self, extent: Extent) {
        self.expand(extent.end());
        for page in extent.page..extent.end() {
            set_bit(&mut self.bitmap, page as usize);
        }
    }

    /// Allocate `pages` contiguous pages, first fit.
    ///
    /// When no free run is long enough the allocator grows past the end of the
    /// file; callers must extend the file to [`ExtentAllocator::total_pages`].
    pub fn allocate(&mut self, pages: u32) -> Extent {
        let count = u64::from(pages.max(1));

        let mut run_start = self.search_hint;
        let mut run_length = 0u64;
        for page in self.search_hint..self.total_pages {
            if get_bit(&self.bitmap, page as usize) {
                run_start = page + 1;
                run_length = 0;
            } else {
                run_length += 1;
                if run_length == count {
                    return self.claim(run_start, count);
                }
            }
        }

        // Extend a free run at the tail, or start a new one.
        let start = self.total_pages - run_length;
        self.expand(start + count);
        self.claim(start, count)
    }

    fn claim(&mut self, start: PageId, count: u64) -> Extent {
        for page in start..start + count {
            set_bit(&mut self.bitmap, page as usize);
        }
        if start == self.search_hint {
            self.search_hint = start + count;
        }
        Extent::new(start, count as u32)
    }

    /// Return an extent's pages to the free pool.
    pub fn free(&mut self, extent: Extent) {
        for page in extent.page..extent.end().min(self.total_pages) {
            clear_bit(&mut self.bitmap, page as usize);
        }
        self.search_hint = self.search_hint.min(extent.page);
    }

    #[cfg(test)]
    #[must_use]
    pub fn is_allocated(&self, page: PageId) -> bool {
        page < self.total_pages && get_bit(&self.bitmap, page as usize)
    }

    #[cfg(test)]
    #[must_use]
    pub fn free_count(&self) -> u64 {
        (0..self.total_pages)
            .filter(|page| !get_bit(&self.bitmap, *page as usize))
            .count() as u64
    }

    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        self.total_pages
    }

    /// Track pages up to `new_total_pages`, marking the new ones free.
    fn expand(&mut self, new_total_pages: u64) {
        if new_total_pages <= self.total_pages {
            return;
        }
        self.bitmap
            .resize((new_total_pages as usize).div_ceil(BITS_PER_BYTE), 0);
        self.total_pages = new_total_pages;
    }
}

fn get_bit(bitmap: &[u8], index: usize) -> bool {
    bitmap
        .get(index / BITS_PER_BYTE)
        .is_some_and(|byte| byte & (1 << (index % BITS_PER_BYTE)) != 0)
}

fn set_bit(bitmap: &mut [u8], index: usize) {
    if let Some(byte) = bitmap.get_mut(index / BITS_PER_BYTE) {
        *byte |= 1 << (index % BITS_PER_BYTE);
    }
}

fn clear_bit(bitmap: &mut [u8], index: usize) {
    if let Some(byte) = bitmap.get_mut(index / BITS_PER_BYTE) {
        *byte &= !(1 << (index % BITS_PER_BYTE));
    }
}

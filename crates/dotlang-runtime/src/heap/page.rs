//! Paged bump allocation for the two heap spaces.
//!
//! A [`Page`] is a fixed-size raw buffer with a bump cursor. A [`Space`] is
//! an ordered list of pages: allocation bumps the selected page, falls back
//! to a gap search across all pages, and finally appends a fresh page. The
//! fast path stays a compare-and-bump; growth past the space's size limit is
//! reported to the caller so the heap can request a collection.

use crate::util::round_up;
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;

/// Which space a [`Space`] instance backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceKind {
    /// The young space all fresh allocations go to.
    Young,
    /// The space tenured objects are promoted into.
    Old,
}

/// A contiguous byte buffer with a bump cursor.
pub struct Page {
    data: NonNull<u8>,
    size: u32,
    top: u32,
}

impl Page {
    /// Allocate a page of `size` bytes, 8-byte aligned.
    ///
    /// Aborts on OOM; the allocator has no fallback.
    fn new(size: u32) -> Page {
        let layout =
            Layout::from_size_align(size as usize, 8).expect("page layout must be constructible");
        let data = unsafe { alloc(layout) };
        let Some(data) = NonNull::new(data) else {
            panic!("out of memory allocating a {size}-byte heap page");
        };
        Page { data, size, top: 0 }
    }

    /// Bump-allocate `even_bytes` (already rounded by the caller).
    ///
    /// Returns `None` when the page cannot hold the request.
    fn allocate(&mut self, even_bytes: u32) -> Option<*mut u8> {
        if self.top + even_bytes > self.size {
            return None;
        }
        let result = unsafe { self.data.as_ptr().add(self.top as usize) };
        self.top += even_bytes;
        Some(result)
    }

    fn remaining(&self) -> u32 {
        self.size - self.top
    }

    fn contains(&self, addr: *const u8) -> bool {
        let base = self.data.as_ptr() as usize;
        let addr = addr as usize;
        addr >= base && addr < base + self.size as usize
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size as usize, 8)
            .expect("page layout must be constructible");
        unsafe { dealloc(self.data.as_ptr(), layout) };
    }
}

/// Result of a [`Space::allocate`] call.
///
/// Allocation always succeeds; `limit_hit` reports that the space had to
/// grow past its size limit, which the heap turns into a needs-gc request.
pub struct SpaceAlloc {
    /// Address of the allocated bytes.
    pub addr: *mut u8,
    /// The space appended a page while already over its size limit.
    pub limit_hit: bool,
}

/// An ordered list of pages forming one half of the heap.
pub struct Space {
    kind: SpaceKind,
    pages: Vec<Page>,
    /// Index of the page the bump fast path targets.
    current: usize,
    page_size: u32,
    size: u32,
    size_limit: u32,
}

impl Space {
    /// Create a space with one empty page of `page_size` bytes.
    pub fn new(kind: SpaceKind, page_size: u32) -> Space {
        let mut space = Space {
            kind,
            pages: vec![Page::new(page_size)],
            current: 0,
            page_size,
            size: page_size,
            size_limit: 0,
        };
        space.compute_size_limit();
        space
    }

    /// Allocate `bytes` (rounded up to an even count) from the space.
    ///
    /// Tries the selected page, then searches every page in order for a
    /// sufficient gap, then appends a page sized to a multiple of
    /// [`page_size`](Self::page_size). The returned flag tells the caller
    /// whether the append happened while the space was over its limit.
    pub fn allocate(&mut self, bytes: u32) -> SpaceAlloc {
        let even_bytes = bytes + (bytes & 1);

        if self.pages[self.current].remaining() < even_bytes {
            match self
                .pages
                .iter()
                .position(|page| page.remaining() >= even_bytes)
            {
                Some(index) => self.current = index,
                None => {
                    let limit_hit = self.size > self.size_limit;
                    self.add_page(even_bytes);
                    let addr = self.pages[self.current]
                        .allocate(even_bytes)
                        .expect("freshly added page must satisfy the allocation");
                    return SpaceAlloc { addr, limit_hit };
                }
            }
        }

        let addr = self.pages[self.current]
            .allocate(even_bytes)
            .expect("selected page has a sufficient gap");
        SpaceAlloc {
            addr,
            limit_hit: false,
        }
    }

    fn add_page(&mut self, bytes: u32) {
        let real_size = round_up(bytes, self.page_size);
        tracing::trace!(kind = ?self.kind, bytes = real_size, total = self.size, "adding heap page");
        self.pages.push(Page::new(real_size));
        self.size += real_size;
        self.current = self.pages.len() - 1;
    }

    /// Take all pages from `other`, releasing our own.
    ///
    /// Used by the collector to publish a freshly evacuated space. The size
    /// limit is recomputed from the new total.
    pub fn swap(&mut self, other: &mut Space) {
        self.pages.clear();
        self.pages.append(&mut other.pages);
        self.size = other.size;
        other.size = 0;
        self.current = 0;
        self.compute_size_limit();
    }

    /// Release every page.
    pub fn clear(&mut self) {
        self.pages.clear();
        self.size = 0;
    }

    fn compute_size_limit(&mut self) {
        self.size_limit = (self.size * 2).max(self.page_size * 2);
    }

    /// Does `addr` fall inside one of this space's pages?
    pub fn contains(&self, addr: *const u8) -> bool {
        self.pages.iter().any(|page| page.contains(addr))
    }

    /// Which space this is.
    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Granularity used when sizing new pages.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Total bytes across all pages.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Current size limit; exceeding it on growth requests a collection.
    pub fn size_limit(&self) -> u32 {
        self.size_limit
    }

    /// Number of pages currently backing the space.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bump_addresses_are_ordered() {
        let mut space = Space::new(SpaceKind::Young, 1024);
        let a = space.allocate(16).addr;
        let b = space.allocate(16).addr;
        assert_eq!(unsafe { a.add(16) }, b);
    }

    #[test]
    fn test_allocate_rounds_to_even() {
        let mut space = Space::new(SpaceKind::Young, 1024);
        let a = space.allocate(7).addr;
        let b = space.allocate(8).addr;
        assert_eq!(unsafe { a.add(8) }, b);
    }

    #[test]
    fn test_exact_fill_then_new_page() {
        let mut space = Space::new(SpaceKind::Young, 64);
        let first = space.allocate(64);
        assert!(!first.limit_hit);
        assert_eq!(space.page_count(), 1);

        // Page is exactly full; the next request takes the gap-search path
        // and appends a page.
        let second = space.allocate(8);
        assert_eq!(space.page_count(), 2);
        assert!(!second.addr.is_null());
    }

    #[test]
    fn test_gap_search_reuses_earlier_page() {
        let mut space = Space::new(SpaceKind::Young, 64);
        space.allocate(40);
        // Force a second page; the first keeps a 24-byte gap.
        space.allocate(48);
        assert_eq!(space.page_count(), 2);

        // Fill the second page, then ask for something the first page's gap
        // can satisfy.
        space.allocate(16);
        let small = space.allocate(16);
        assert_eq!(space.page_count(), 2);
        assert!(space.contains(small.addr));
    }

    #[test]
    fn test_oversized_request_gets_rounded_page() {
        let mut space = Space::new(SpaceKind::Young, 64);
        space.allocate(200);
        // 200 rounds up to a 256-byte page.
        assert_eq!(space.size(), 64 + 256);
    }

    #[test]
    fn test_limit_hit_reported_once_over_budget() {
        let mut space = Space::new(SpaceKind::Young, 64);
        assert_eq!(space.size_limit(), 128);

        let mut saw_limit_hit = false;
        for _ in 0..16 {
            saw_limit_hit |= space.allocate(48).limit_hit;
        }
        assert!(saw_limit_hit);
    }

    #[test]
    fn test_swap_takes_pages_and_recomputes_limit() {
        let mut dest = Space::new(SpaceKind::Young, 64);
        let mut src = Space::new(SpaceKind::Young, 64);
        for _ in 0..8 {
            src.allocate(48);
        }
        let marker = src.allocate(16).addr;
        let src_size = src.size();

        dest.swap(&mut src);
        assert_eq!(dest.size(), src_size);
        assert_eq!(src.size(), 0);
        assert!(dest.contains(marker));
        assert_eq!(dest.size_limit(), dest.size() * 2);
    }

    #[test]
    fn test_clear_releases_everything() {
        let mut space = Space::new(SpaceKind::Old, 64);
        let addr = space.allocate(16).addr;
        space.clear();
        assert_eq!(space.size(), 0);
        assert_eq!(space.page_count(), 0);
        assert!(!space.contains(addr));
    }

    #[test]
    fn test_contains_rejects_foreign_addresses() {
        let space = Space::new(SpaceKind::Young, 64);
        let local = 0u64;
        assert!(!space.contains(&local as *const u64 as *const u8));
    }
}

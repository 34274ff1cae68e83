//! Shared page cache, keyed by `(run_id, page_no)`.

use quick_cache::sync::Cache;
use std::sync::Arc;

/// Caches decoded-extent page bytes after they are fetched from disk.
///
/// Pages are fixed-size, so entries are weighed uniformly; capacity is a page
/// count. Lookups insert on miss when the engine's cache policy asks for it.
pub struct PageCache {
    inner: Cache<(u64, u32), Arc<[u8]>>,
}

impl PageCache {
    #[must_use]
    pub fn with_capacity_pages(pages: usize) -> Self {
        Self {
            inner: Cache::new(pages.max(1)),
        }
    }

    #[must_use]
    pub fn get(&self, run_id: u64, page: u32) -> Option<Arc<[u8]>> {
        self.inner.get(&(run_id, page))
    }

    pub fn insert(&self, run_id: u64, page: u32, bytes: Arc<[u8]>) {
        self.inner.insert((run_id, page), bytes);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache")
            .field("pages", &self.inner.len())
            .finish()
    }
}

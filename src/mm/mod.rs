// Memory management: buddy page allocator, slab caches and the general
// heap layered on top of them.

pub mod heap;
pub mod page;
pub mod slab;
pub mod zone;

pub use heap::{ufree, umalloc, urealloc, usable_size, uzalloc};
pub use page::VPage;
pub use slab::SlabCache;
pub use zone::{
    alloc_pages, compound_head, compound_order, free_pages, get_free_pages, page_to_virt,
    setup_memory, virt_to_page, GFP_COMP, GFP_ZERO,
};

/// Serializes unit tests that assert on global zone accounting; the buddy
/// state is process-wide and the test harness runs in parallel.
#[cfg(test)]
pub(crate) fn test_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

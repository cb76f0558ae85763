// General heap over the slab and page layers.
//
// Small allocations come from power-of-two size-class caches; anything past
// the largest class gets its own compound page run with the order recorded
// in the head descriptor, so freeing needs only the pointer.

use once_cell::sync::Lazy;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::config::{MAX_ORDER, VPAGE_SHIFT, VPAGE_SIZE};
use crate::error::{Result, RtError};
use crate::mm::page::block_bytes;
use crate::mm::slab::SlabCache;
use crate::mm::zone::{alloc_pages, compound_head, free_pages, page_to_virt, virt_to_page, GFP_COMP};
use crate::utils::bitops::{align_up, ilog2, roundup_pow_of_two};

const MIN_CLASS_SHIFT: usize = 3; // 8 bytes
const MAX_CLASS_SHIFT: usize = VPAGE_SHIFT - 1; // half a page

static CLASSES: Lazy<Vec<Arc<SlabCache>>> = Lazy::new(|| {
    (MIN_CLASS_SHIFT..=MAX_CLASS_SHIFT)
        .map(|shift| {
            SlabCache::new(&format!("umalloc-{}", 1usize << shift), 1 << shift, None, None)
                .expect("heap size class creation cannot fail")
        })
        .collect()
});

fn class_for(size: usize) -> &'static Arc<SlabCache> {
    let shift = ilog2(roundup_pow_of_two(size.max(1 << MIN_CLASS_SHIFT)));
    &CLASSES[shift - MIN_CLASS_SHIFT]
}

/// Allocate `size` bytes.
pub fn umalloc(size: usize) -> Result<NonNull<u8>> {
    if size <= (1 << MAX_CLASS_SHIFT) {
        return class_for(size).alloc();
    }

    let pages = align_up(size, VPAGE_SIZE) >> VPAGE_SHIFT;
    let order = ilog2(roundup_pow_of_two(pages));
    if order >= MAX_ORDER {
        return Err(RtError::InvalidArgument(format!(
            "allocation of {} bytes exceeds the page allocator",
            size
        )));
    }
    let page = alloc_pages(GFP_COMP, order)?;
    page.set_private_flag(true);
    // Safety: page VAs are nonzero.
    Ok(unsafe { NonNull::new_unchecked(page_to_virt(page)) })
}

/// Allocate zeroed memory.
pub fn uzalloc(size: usize) -> Result<NonNull<u8>> {
    let ptr = umalloc(size)?;
    unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, usable_size(ptr)) };
    Ok(ptr)
}

/// Free memory returned by `umalloc`/`uzalloc`/`urealloc`.
pub fn ufree(ptr: NonNull<u8>) {
    let page = compound_head(
        virt_to_page(ptr.as_ptr()).expect("ufree of a pointer the heap does not own"),
    );
    if page.is_slab() {
        // Safety: heap size-class caches are 'static; their address was
        // recorded as the slab owner at grow time.
        let cache = unsafe { &*(page.owner() as *const SlabCache) };
        cache.free(ptr);
        return;
    }
    assert!(page.is_private(), "ufree of a pointer the heap does not own");
    assert_eq!(page_to_virt(page), ptr.as_ptr(), "ufree of an interior pointer");
    let order = page.order().max(0) as usize;
    page.set_private_flag(false);
    free_pages(page, order);
}

/// Usable bytes behind a heap pointer.
pub fn usable_size(ptr: NonNull<u8>) -> usize {
    let page = compound_head(virt_to_page(ptr.as_ptr()).expect("foreign pointer"));
    if page.is_slab() {
        let cache = unsafe { &*(page.owner() as *const SlabCache) };
        cache.obj_size()
    } else {
        block_bytes(page.order().max(0) as usize)
    }
}

/// Grow or shrink an allocation, preserving contents up to the smaller of
/// the old and new sizes.
pub fn urealloc(ptr: Option<NonNull<u8>>, new_size: usize) -> Result<NonNull<u8>> {
    let Some(old) = ptr else {
        return umalloc(new_size);
    };
    let old_usable = usable_size(old);
    if new_size <= old_usable && new_size * 2 > old_usable {
        return Ok(old);
    }
    let fresh = umalloc(new_size)?;
    unsafe {
        std::ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), old_usable.min(new_size));
    }
    ufree(old);
    Ok(fresh)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_come_from_slabs() {
        let _g = crate::mm::test_guard();
        let a = umalloc(24).unwrap();
        let b = umalloc(24).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        assert_eq!(usable_size(a), 32);
        let page = compound_head(virt_to_page(a.as_ptr()).unwrap());
        assert!(page.is_slab());
        ufree(a);
        ufree(b);
    }

    #[test]
    fn large_allocations_are_compound_pages() {
        let _g = crate::mm::test_guard();
        let size = VPAGE_SIZE * 3;
        let ptr = umalloc(size).unwrap();
        assert!(usable_size(ptr) >= size);
        let page = compound_head(virt_to_page(ptr.as_ptr()).unwrap());
        assert!(page.is_compound_head());
        assert!(!page.is_slab());
        ufree(ptr);
    }

    #[test]
    fn zalloc_zeroes_and_realloc_preserves() {
        let _g = crate::mm::test_guard();
        let ptr = uzalloc(1024).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0));

        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5a, 1024) };
        let grown = urealloc(Some(ptr), 128 * 1024).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(grown.as_ptr(), 1024) };
        assert!(bytes.iter().all(|&b| b == 0x5a));
        ufree(grown);
    }
}

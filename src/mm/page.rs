// Virtual page descriptors.
//
// One fixed-size `VPage` record exists per virtual page of the reserved
// window. Descriptors for a node live in the head of that node's first
// committed block, so pfn <-> descriptor conversion is pure arithmetic.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicUsize, Ordering};

use crate::config::{NODES_SHIFT, VPAGE_SIZE};
use crate::utils::bitops::{clear_bit, set_bit, test_and_clear_bit, test_and_set_bit, test_bit};
use crate::utils::uref::Uref;

pub type Pfn = usize;

/// Freelist link terminator.
pub const PFN_NIL: u32 = u32::MAX;

// Page flag bits. The node id lives in the top `NODES_SHIFT` bits of the
// same word.
pub const PG_INITED: usize = 0;
pub const PG_RESERVED: usize = 1;
/// Head of a compound run.
pub const PG_HEAD: usize = 2;
/// Tail of a compound run; `private` points back at the head pfn.
pub const PG_TAIL: usize = 3;
/// Linked on a buddy freelist.
pub const PG_LRU: usize = 4;
pub const PG_PRIVATE: usize = 5;
pub const PG_SLAB: usize = 6;

const NODE_BITS_SHIFT: usize = usize::BITS as usize - NODES_SHIFT;
const NODE_MASK: usize = ((1 << NODES_SHIFT) - 1) << NODE_BITS_SHIFT;

/// Per-page descriptor. Lives inside the reserved region of its node; all
/// fields are atomics so descriptors can be shared freely, but list linkage
/// and order are only written under the owning zone's lock (or while the
/// page is privately owned by an allocator path).
#[repr(C)]
pub struct VPage {
    flags: AtomicUsize,
    /// log2 of the block this page heads (free block or allocated run);
    /// -1 when the page is not a block head.
    order: AtomicI32,
    /// References (buddy: allocation liveness; slab: objects in use).
    pub count: Uref,
    /// Freelist / slab-list linkage by pfn.
    next: AtomicU32,
    prev: AtomicU32,
    /// Private slot: slab freelist head, compound head pfn on tails, or
    /// whatever the page owner stashes here.
    private: AtomicUsize,
    /// Slab cache back-pointer for slab pages.
    owner: AtomicUsize,
}

impl VPage {
    pub(super) fn reset(&self, nid: usize, reserved: bool) {
        self.flags.store(0, Ordering::SeqCst);
        self.order.store(-1, Ordering::SeqCst);
        self.count.set(0);
        self.next.store(PFN_NIL, Ordering::SeqCst);
        self.prev.store(PFN_NIL, Ordering::SeqCst);
        self.private.store(0, Ordering::SeqCst);
        self.owner.store(0, Ordering::SeqCst);
        self.set_node(nid);
        set_bit(PG_INITED, &self.flags);
        if reserved {
            set_bit(PG_RESERVED, &self.flags);
        }
    }

    #[inline]
    pub fn is_inited(&self) -> bool {
        test_bit(PG_INITED, &self.flags)
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        test_bit(PG_RESERVED, &self.flags)
    }

    #[inline]
    pub fn is_on_freelist(&self) -> bool {
        test_bit(PG_LRU, &self.flags)
    }

    pub(super) fn set_on_freelist(&self, on: bool) {
        if on {
            set_bit(PG_LRU, &self.flags);
        } else {
            clear_bit(PG_LRU, &self.flags);
        }
    }

    #[inline]
    pub fn is_compound_head(&self) -> bool {
        test_bit(PG_HEAD, &self.flags)
    }

    #[inline]
    pub fn is_compound_tail(&self) -> bool {
        test_bit(PG_TAIL, &self.flags)
    }

    #[inline]
    pub fn is_compound(&self) -> bool {
        self.is_compound_head() || self.is_compound_tail()
    }

    #[inline]
    pub fn is_slab(&self) -> bool {
        test_bit(PG_SLAB, &self.flags)
    }

    pub fn set_slab(&self) {
        assert!(!test_and_set_bit(PG_SLAB, &self.flags), "page already a slab");
    }

    pub fn clear_slab(&self) {
        assert!(test_and_clear_bit(PG_SLAB, &self.flags), "page was not a slab");
    }

    #[inline]
    pub fn is_private(&self) -> bool {
        test_bit(PG_PRIVATE, &self.flags)
    }

    pub fn set_private_flag(&self, on: bool) {
        if on {
            set_bit(PG_PRIVATE, &self.flags);
        } else {
            clear_bit(PG_PRIVATE, &self.flags);
        }
    }

    fn set_node(&self, nid: usize) {
        let mut flags = self.flags.load(Ordering::SeqCst);
        loop {
            let want = (flags & !NODE_MASK) | (nid << NODE_BITS_SHIFT);
            match self
                .flags
                .compare_exchange_weak(flags, want, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return,
                Err(f) => flags = f,
            }
        }
    }

    #[inline]
    pub fn nid(&self) -> usize {
        (self.flags.load(Ordering::SeqCst) & NODE_MASK) >> NODE_BITS_SHIFT
    }

    #[inline]
    pub fn order(&self) -> i32 {
        self.order.load(Ordering::SeqCst)
    }

    pub(super) fn set_order(&self, order: i32) {
        self.order.store(order, Ordering::SeqCst);
    }

    #[inline]
    pub(super) fn next_pfn(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }

    #[inline]
    pub(super) fn prev_pfn(&self) -> u32 {
        self.prev.load(Ordering::SeqCst)
    }

    pub(super) fn set_links(&self, prev: u32, next: u32) {
        self.prev.store(prev, Ordering::SeqCst);
        self.next.store(next, Ordering::SeqCst);
    }

    pub(super) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::SeqCst);
    }

    pub(super) fn set_prev(&self, prev: u32) {
        self.prev.store(prev, Ordering::SeqCst);
    }

    #[inline]
    pub fn private(&self) -> usize {
        self.private.load(Ordering::SeqCst)
    }

    pub fn set_private(&self, val: usize) {
        self.private.store(val, Ordering::SeqCst);
    }

    #[inline]
    pub fn owner(&self) -> usize {
        self.owner.load(Ordering::SeqCst)
    }

    pub fn set_owner(&self, val: usize) {
        self.owner.store(val, Ordering::SeqCst);
    }

    pub(super) fn make_compound_head(&self, order: usize) {
        set_bit(PG_HEAD, &self.flags);
        self.set_order(order as i32);
    }

    pub(super) fn make_compound_tail(&self, head_pfn: Pfn) {
        set_bit(PG_TAIL, &self.flags);
        self.set_private(head_pfn);
    }

    pub(super) fn clear_compound(&self) {
        clear_bit(PG_HEAD, &self.flags);
        clear_bit(PG_TAIL, &self.flags);
        self.set_private(0);
    }
}

/// Bytes spanned by an order-`k` block.
#[inline]
pub const fn block_bytes(order: usize) -> usize {
    VPAGE_SIZE << order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_and_node_coexist() {
        let page = VPage {
            flags: AtomicUsize::new(0),
            order: AtomicI32::new(0),
            count: Uref::zero(),
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
            private: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
        };
        page.reset(3, true);
        assert!(page.is_inited());
        assert!(page.is_reserved());
        assert_eq!(page.nid(), 3);
        assert_eq!(page.order(), -1);

        page.set_on_freelist(true);
        assert!(page.is_on_freelist());
        assert_eq!(page.nid(), 3);
        page.set_on_freelist(false);
        assert!(!page.is_on_freelist());
    }

    #[test]
    fn compound_markers() {
        let page = VPage {
            flags: AtomicUsize::new(0),
            order: AtomicI32::new(-1),
            count: Uref::zero(),
            next: AtomicU32::new(0),
            prev: AtomicU32::new(0),
            private: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
        };
        page.reset(0, false);
        page.make_compound_head(3);
        assert!(page.is_compound_head());
        assert_eq!(page.order(), 3);
        page.clear_compound();
        assert!(!page.is_compound());
    }
}

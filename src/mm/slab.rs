// Slab object caches.
//
// A slab is one compound page whose private slot heads a freelist of
// objects inside the page. Each CPU slot keeps a small magazine of free
// objects so the hot path touches no shared state; misses refill from the
// partial-slab list under the cache lock. A slab's in-use count lives in
// its head page descriptor, so freeing needs only the object pointer.

use crossbeam::utils::CachePadded;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config;
use crate::error::{Result, RtError};
use crate::mm::page::{block_bytes, Pfn, VPage};
use crate::mm::zone::{
    alloc_pages, compound_head, free_pages, page_of_pfn, page_to_virt, pfn_of_page, virt_to_page,
    GFP_COMP,
};
use crate::utils::bitops::align_up;
use crate::utils::current_cpu;
use crate::utils::spinlock::SpinLock;

/// Objects a slab should hold at minimum; drives the per-slab order.
const SLAB_MIN_OBJS: usize = 16;
/// Fully-free slabs kept around before release to the page layer.
const SLAB_KEEP_EMPTY: usize = 2;

pub type ObjCtor = fn(*mut u8);

struct SlabLists {
    /// Slabs with free objects (fully-free ones included).
    partial: Vec<Pfn>,
    /// Slabs whose in-page freelist is exhausted.
    full: Vec<Pfn>,
    nr_empty: usize,
}

pub struct SlabCache {
    name: String,
    obj_size: usize,
    order: usize,
    objs_per_slab: usize,
    mag_cap: usize,
    ctor: Option<ObjCtor>,
    dtor: Option<ObjCtor>,
    cpu_mags: Box<[CachePadded<SpinLock<Vec<*mut u8>>>]>,
    lists: SpinLock<SlabLists>,
    nr_allocs: AtomicUsize,
    nr_frees: AtomicUsize,
}

// Safety: magazines hold raw object pointers owned by this cache; all
// shared state is behind the per-CPU and cache locks.
unsafe impl Send for SlabCache {}
unsafe impl Sync for SlabCache {}

impl SlabCache {
    /// Create a cache of `obj_size`-byte objects.
    pub fn new(
        name: &str,
        obj_size: usize,
        ctor: Option<ObjCtor>,
        dtor: Option<ObjCtor>,
    ) -> Result<Arc<Self>> {
        if obj_size == 0 {
            return Err(RtError::InvalidArgument("zero-sized slab object".into()));
        }
        let obj_size = align_up(obj_size, std::mem::size_of::<usize>());

        // Smallest order where a slab carries a reasonable object count.
        let mut order = 0;
        while order < crate::config::MAX_ORDER - 1
            && block_bytes(order) / obj_size < SLAB_MIN_OBJS
        {
            order += 1;
        }
        let objs_per_slab = block_bytes(order) / obj_size;
        if objs_per_slab == 0 {
            return Err(RtError::InvalidArgument(format!(
                "slab object of {} bytes is too large",
                obj_size
            )));
        }

        let mag_cap = (objs_per_slab / 2).clamp(4, 64);
        let cpu_mags = (0..config::nr_cpus())
            .map(|_| CachePadded::new(SpinLock::new(Vec::with_capacity(mag_cap))))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        log::debug!(
            "slab cache {}: obj {}B, order {}, {} objs/slab, magazine {}",
            name,
            obj_size,
            order,
            objs_per_slab,
            mag_cap
        );

        Ok(Arc::new(Self {
            name: name.to_owned(),
            obj_size,
            order,
            objs_per_slab,
            mag_cap,
            ctor,
            dtor,
            cpu_mags,
            lists: SpinLock::new(SlabLists {
                partial: Vec::new(),
                full: Vec::new(),
                nr_empty: 0,
            }),
            nr_allocs: AtomicUsize::new(0),
            nr_frees: AtomicUsize::new(0),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Usable bytes per object.
    pub fn obj_size(&self) -> usize {
        self.obj_size
    }

    /// Slabs currently owned by the cache.
    pub fn nr_slabs(&self) -> usize {
        let lists = self.lists.lock();
        lists.partial.len() + lists.full.len()
    }

    /// Lifetime (allocations, frees) counters.
    pub fn stats(&self) -> (usize, usize) {
        (
            self.nr_allocs.load(Ordering::Relaxed),
            self.nr_frees.load(Ordering::Relaxed),
        )
    }

    pub fn alloc(self: &Arc<Self>) -> Result<NonNull<u8>> {
        let mut mag = self.cpu_mags[current_cpu()].lock();
        if mag.is_empty() {
            self.refill(&mut mag)?;
        }
        let obj = mag.pop().expect("refilled magazine is empty");
        self.nr_allocs.fetch_add(1, Ordering::Relaxed);
        // Safety: objects live inside slab pages, never at VA zero.
        Ok(unsafe { NonNull::new_unchecked(obj) })
    }

    pub fn free(&self, obj: NonNull<u8>) {
        self.nr_frees.fetch_add(1, Ordering::Relaxed);
        let mut mag = self.cpu_mags[current_cpu()].lock();
        if mag.len() >= self.mag_cap {
            // Flush half of the magazine back to the owning slabs.
            let mut lists = self.lists.lock();
            for _ in 0..self.mag_cap / 2 {
                let flushed = mag.pop().expect("magazine drained under us");
                self.release_obj(&mut lists, flushed);
            }
        }
        mag.push(obj.as_ptr());
    }

    /// Pull objects into `mag`, unlinking slabs from the partial list and
    /// growing the cache by one slab when none remain.
    fn refill(self: &Arc<Self>, mag: &mut Vec<*mut u8>) -> Result<()> {
        let mut lists = self.lists.lock();
        let target = (self.mag_cap / 2).max(1);

        while mag.len() < target {
            let pfn = match lists.partial.last().copied() {
                Some(pfn) => pfn,
                None => {
                    match self.grow(&mut lists) {
                        Ok(pfn) => pfn,
                        // Partial progress is still progress.
                        Err(_) if !mag.is_empty() => break,
                        Err(err) => return Err(err),
                    }
                }
            };
            let page = page_of_pfn(pfn);

            let head = page.private();
            if head == 0 {
                lists.partial.pop();
                lists.full.push(pfn);
                continue;
            }
            if page.count.read() == 0 {
                lists.nr_empty -= 1;
            }
            // Safety: `head` points at a free object inside this slab; its
            // first word is the freelist link.
            let next = unsafe { *(head as *const usize) };
            page.set_private(next);
            page.count.set(page.count.read() + 1);
            mag.push(head as *mut u8);
        }
        Ok(())
    }

    /// Allocate and thread a fresh slab; returns its pfn.
    fn grow(self: &Arc<Self>, lists: &mut SlabLists) -> Result<Pfn> {
        let page = alloc_pages(GFP_COMP, self.order)
            .map_err(|_| RtError::OutOfMemory("slab grow failed"))?;
        let base = page_to_virt(page);

        page.set_slab();
        page.set_owner(Arc::as_ptr(self) as usize);
        page.count.set(0);

        // Thread the in-page freelist back to front and run constructors.
        let mut head = 0usize;
        for i in (0..self.objs_per_slab).rev() {
            let obj = unsafe { base.add(i * self.obj_size) };
            if let Some(ctor) = self.ctor {
                ctor(obj);
            }
            unsafe { *(obj as *mut usize) = head };
            head = obj as usize;
        }
        page.set_private(head);

        let pfn = pfn_of_page(page);
        lists.partial.push(pfn);
        lists.nr_empty += 1;
        log::debug!("slab cache {}: grew slab at pfn {}", self.name, pfn);
        Ok(pfn)
    }

    /// Return one object to its slab (cache lock held).
    fn release_obj(&self, lists: &mut SlabLists, obj: *mut u8) {
        let page = compound_head(virt_to_page(obj).expect("freeing a foreign pointer"));
        debug_assert!(page.is_slab());
        debug_assert_eq!(page.owner(), self as *const Self as usize);

        let head = page.private();
        // Safety: the object is returning to the cache; reuse its first
        // word as the freelist link.
        unsafe { *(obj as *mut usize) = head };
        page.set_private(obj as usize);

        let inuse = page.count.read();
        debug_assert!(inuse > 0, "slab in-use underflow");
        page.count.set(inuse - 1);

        let pfn = pfn_of_page(page);
        if head == 0 {
            // Was full; it has a free object again.
            if let Some(i) = lists.full.iter().position(|&p| p == pfn) {
                lists.full.swap_remove(i);
                lists.partial.push(pfn);
            }
        }

        if inuse - 1 == 0 {
            lists.nr_empty += 1;
            if lists.nr_empty > SLAB_KEEP_EMPTY {
                if let Some(i) = lists.partial.iter().position(|&p| p == pfn) {
                    lists.partial.swap_remove(i);
                    lists.nr_empty -= 1;
                    self.destroy_slab(page);
                }
            }
        }
    }

    /// Run destructors over the slab and hand its pages back.
    fn destroy_slab(&self, page: &'static VPage) {
        let base = page_to_virt(page);
        if let Some(dtor) = self.dtor {
            for i in 0..self.objs_per_slab {
                dtor(unsafe { base.add(i * self.obj_size) });
            }
        }
        page.clear_slab();
        page.set_owner(0);
        page.set_private(0);
        free_pages(page, self.order);
    }
}

impl Drop for SlabCache {
    fn drop(&mut self) {
        // Drain magazines back into their slabs first.
        let mags: Vec<*mut u8> = self
            .cpu_mags
            .iter()
            .flat_map(|m| std::mem::take(&mut *m.lock()))
            .collect();
        {
            let mut lists = self.lists.lock();
            for obj in mags {
                self.release_obj(&mut lists, obj);
            }
        }

        let mut lists = self.lists.lock();
        let leaked: usize = lists
            .full
            .iter()
            .chain(lists.partial.iter())
            .map(|&pfn| page_of_pfn(pfn).count.read() as usize)
            .sum();
        if leaked > 0 {
            log::warn!(
                "slab cache {}: destroyed with {} live objects",
                self.name,
                leaked
            );
        }
        for pfn in lists.full.drain(..).collect::<Vec<_>>() {
            self.destroy_slab(page_of_pfn(pfn));
        }
        for pfn in lists.partial.drain(..).collect::<Vec<_>>() {
            self.destroy_slab(page_of_pfn(pfn));
        }
        lists.nr_empty = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn alloc_objects_live_in_slab_pages() {
        let _g = crate::mm::test_guard();
        let cache = SlabCache::new("test-128", 128, None, None).unwrap();
        let mut objs = Vec::new();
        for _ in 0..64 {
            objs.push(cache.alloc().unwrap());
        }
        let mut seen = HashSet::new();
        for obj in &objs {
            assert!(seen.insert(obj.as_ptr() as usize), "duplicate object");
            let page = compound_head(virt_to_page(obj.as_ptr()).unwrap());
            assert!(page.is_slab());
            assert_eq!(page.owner(), Arc::as_ptr(&cache) as usize);
        }
        for obj in objs {
            cache.free(obj);
        }
    }

    #[test]
    fn slab_count_settles_after_churn() {
        let _g = crate::mm::test_guard();
        let cache = SlabCache::new("test-churn", 64, None, None).unwrap();
        let mut objs = Vec::new();
        for _ in 0..1024 {
            objs.push(cache.alloc().unwrap());
        }
        let peak = cache.nr_slabs();
        assert!(peak >= 1);
        // Free back-to-front so slabs drain in reverse allocation order.
        while let Some(obj) = objs.pop() {
            cache.free(obj);
        }
        // Retention keeps a bounded number of empty slabs.
        assert!(cache.nr_slabs() <= peak);
    }

    #[test]
    fn constructors_run_once_per_slab_object() {
        let _g = crate::mm::test_guard();
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        fn ctor(obj: *mut u8) {
            CTOR_RUNS.fetch_add(1, Ordering::SeqCst);
            unsafe { *obj = 0xa5 };
        }
        let cache = SlabCache::new("test-ctor", 512, Some(ctor), None).unwrap();
        let a = cache.alloc().unwrap();
        let runs = CTOR_RUNS.load(Ordering::SeqCst);
        // One whole slab was constructed up front.
        assert!(runs >= SLAB_MIN_OBJS);
        let b = cache.alloc().unwrap();
        assert_eq!(CTOR_RUNS.load(Ordering::SeqCst), runs);
        cache.free(a);
        cache.free(b);
    }
}

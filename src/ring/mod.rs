// Lock-free MPMC ring buffer.
//
// Two cache-padded head/tail pairs track producers and consumers; each pair
// carries a single/multi mode fixed at construction. Slots hold plain
// values (typically pointers or indices). Unsigned 32-bit arithmetic keeps
// the index invariant through wrap-around:
//
//   0 <= cons.tail <= cons.head <= prod.tail <= prod.head
//     <= cons.tail + capacity            (mod 2^32)

use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{Result, RtError};
use crate::utils::bitops::is_power_of_2;

/// Enqueue side is single-producer.
pub const RING_F_SP_ENQ: u32 = 0x1;
/// Dequeue side is single-consumer.
pub const RING_F_SC_DEQ: u32 = 0x2;
/// Honor the requested capacity exactly (internal size rounds up).
pub const RING_F_EXACT_SZ: u32 = 0x4;

const RING_SZ_MASK: u32 = 0x7fff_ffff;

struct HeadTail {
    head: AtomicU32,
    tail: AtomicU32,
    single: bool,
}

impl HeadTail {
    fn new(single: bool) -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            single,
        }
    }
}

pub struct Ring<T> {
    size: u32,
    mask: u32,
    capacity: u32,
    prod: CachePadded<HeadTail>,
    cons: CachePadded<HeadTail>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: slots are published through the tail stores (release) and read
// after the matching acquire; a slot is owned by exactly one side between
// head claim and tail publication.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

impl<T: Copy> Ring<T> {
    /// Create a ring for `count` entries.
    ///
    /// Without `RING_F_EXACT_SZ`, `count` must be a power of two and the
    /// usable capacity is `count - 1`.
    pub fn new(count: u32, flags: u32) -> Result<Self> {
        if flags & !(RING_F_SP_ENQ | RING_F_SC_DEQ | RING_F_EXACT_SZ) != 0 {
            return Err(RtError::InvalidArgument("unknown ring flags".into()));
        }

        let (size, capacity) = if flags & RING_F_EXACT_SZ != 0 {
            let size = (count + 1).next_power_of_two();
            (size, count)
        } else {
            if !is_power_of_2(count as usize) || count > RING_SZ_MASK {
                return Err(RtError::InvalidArgument(
                    "ring size must be a power of 2 within the size limit".into(),
                ));
            }
            (count, count - 1)
        };
        if size > RING_SZ_MASK {
            return Err(RtError::InvalidArgument("ring size limit exceeded".into()));
        }

        let slots = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Self {
            size,
            mask: size - 1,
            capacity,
            prod: CachePadded::new(HeadTail::new(flags & RING_F_SP_ENQ != 0)),
            cons: CachePadded::new(HeadTail::new(flags & RING_F_SC_DEQ != 0)),
            slots,
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Entries currently available to consumers.
    pub fn len(&self) -> u32 {
        let count = self
            .prod
            .tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.cons.head.load(Ordering::Acquire));
        count.min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_space() == 0
    }

    /// Free entries currently available to producers.
    pub fn free_space(&self) -> u32 {
        self.capacity
            .wrapping_add(self.cons.tail.load(Ordering::Acquire))
            .wrapping_sub(self.prod.head.load(Ordering::Acquire))
            .min(self.capacity)
    }

    // ------------------------------------------------------------------
    // Enqueue
    // ------------------------------------------------------------------

    /// Enqueue all of `objs` or nothing. Returns the number enqueued
    /// (0 or `objs.len()`).
    pub fn enqueue_bulk(&self, objs: &[T]) -> u32 {
        self.do_enqueue(objs, true).0
    }

    /// Enqueue as many of `objs` as fit; returns the number enqueued.
    pub fn enqueue_burst(&self, objs: &[T]) -> u32 {
        self.do_enqueue(objs, false).0
    }

    /// Enqueue one value; `false` when the ring is full.
    pub fn enqueue(&self, obj: T) -> bool {
        self.enqueue_bulk(std::slice::from_ref(&obj)) == 1
    }

    /// Bulk enqueue also reporting the free space left afterwards.
    pub fn enqueue_bulk_free(&self, objs: &[T]) -> (u32, u32) {
        self.do_enqueue(objs, true)
    }

    fn do_enqueue(&self, objs: &[T], fixed: bool) -> (u32, u32) {
        let is_sp = self.prod.single;
        let (n, old_head) = match self.move_prod_head(is_sp, objs.len() as u32, fixed) {
            (0, _, free) => return (0, free),
            (n, old, _) => (n, old),
        };

        for (i, obj) in objs.iter().take(n as usize).enumerate() {
            let idx = (old_head.wrapping_add(i as u32) & self.mask) as usize;
            // Safety: slots [old_head, old_head+n) are claimed by this
            // producer until the tail store below publishes them.
            unsafe { (*self.slots[idx].get()).write(*obj) };
        }

        self.update_tail(&self.prod, old_head, old_head.wrapping_add(n), is_sp);
        (n, self.free_space())
    }

    fn move_prod_head(&self, is_sp: bool, n: u32, fixed: bool) -> (u32, u32, u32) {
        loop {
            let old_head = self.prod.head.load(Ordering::Relaxed);
            let free = self
                .capacity
                .wrapping_add(self.cons.tail.load(Ordering::Acquire))
                .wrapping_sub(old_head);

            let mut take = n;
            if take > free {
                take = if fixed { 0 } else { free };
            }
            if take == 0 {
                return (0, 0, free);
            }

            let new_head = old_head.wrapping_add(take);
            if is_sp {
                self.prod.head.store(new_head, Ordering::Relaxed);
                return (take, old_head, free);
            }
            if self
                .prod
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (take, old_head, free);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dequeue
    // ------------------------------------------------------------------

    /// Fill all of `out` or nothing. Returns the number dequeued
    /// (0 or `out.len()`).
    pub fn dequeue_bulk(&self, out: &mut [T]) -> u32 {
        self.do_dequeue(out.as_mut_ptr(), out.len() as u32, true).0
    }

    /// Dequeue up to `out.len()` entries; returns the number dequeued.
    pub fn dequeue_burst(&self, out: &mut [T]) -> u32 {
        self.do_dequeue(out.as_mut_ptr(), out.len() as u32, false).0
    }

    /// Dequeue one value.
    pub fn dequeue(&self) -> Option<T> {
        let mut slot = MaybeUninit::<T>::uninit();
        let (taken, _) = self.do_dequeue(slot.as_mut_ptr(), 1, true);
        if taken == 1 {
            // Safety: do_dequeue wrote the slot before reporting success.
            Some(unsafe { slot.assume_init() })
        } else {
            None
        }
    }

    /// Bulk dequeue also reporting the entries still available afterwards.
    pub fn dequeue_bulk_available(&self, out: &mut [T]) -> (u32, u32) {
        self.do_dequeue(out.as_mut_ptr(), out.len() as u32, true)
    }

    fn do_dequeue(&self, out: *mut T, len: u32, fixed: bool) -> (u32, u32) {
        let is_sc = self.cons.single;
        let (n, old_head) = match self.move_cons_head(is_sc, len, fixed) {
            (0, _, avail) => return (0, avail),
            (n, old, _) => (n, old),
        };

        for i in 0..n {
            let idx = (old_head.wrapping_add(i) & self.mask) as usize;
            // Safety: slots [old_head, old_head+n) were published by the
            // producer tail store we synchronized with; `out` has room for
            // `len >= n` entries.
            unsafe { out.add(i as usize).write((*self.slots[idx].get()).assume_init_read()) };
        }

        self.update_tail(&self.cons, old_head, old_head.wrapping_add(n), is_sc);
        (n, self.len())
    }

    fn move_cons_head(&self, is_sc: bool, n: u32, fixed: bool) -> (u32, u32, u32) {
        loop {
            let old_head = self.cons.head.load(Ordering::Relaxed);
            let entries = self
                .prod
                .tail
                .load(Ordering::Acquire)
                .wrapping_sub(old_head);

            let mut take = n;
            if take > entries {
                take = if fixed { 0 } else { entries };
            }
            if take == 0 {
                return (0, 0, entries);
            }

            let new_head = old_head.wrapping_add(take);
            if is_sc {
                self.cons.head.store(new_head, Ordering::Relaxed);
                return (take, old_head, entries);
            }
            if self
                .cons
                .head
                .compare_exchange_weak(old_head, new_head, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return (take, old_head, entries);
            }
        }
    }

    /// Publish `[old, new)`. Multi mode waits for preceding claimants to
    /// publish first so tails advance in claim order.
    fn update_tail(&self, ht: &HeadTail, old: u32, new: u32, single: bool) {
        if !single {
            let backoff = Backoff::new();
            while ht.tail.load(Ordering::Relaxed) != old {
                backoff.snooze();
            }
        }
        ht.tail.store(new, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_roundtrip() {
        let ring: Ring<usize> = Ring::new(16, 0).unwrap();
        assert_eq!(ring.capacity(), 15);
        for i in 0..15 {
            assert!(ring.enqueue(i));
        }
        assert!(ring.is_full());
        assert!(!ring.enqueue(99));
        for i in 0..15 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn exact_size_capacity() {
        let ring: Ring<usize> = Ring::new(127, RING_F_EXACT_SZ).unwrap();
        assert_eq!(ring.capacity(), 127);
        for i in 0..127 {
            assert!(ring.enqueue(i));
        }
        assert!(!ring.enqueue(127));
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(Ring::<usize>::new(100, 0).is_err());
        assert!(Ring::<usize>::new(100, RING_F_EXACT_SZ).is_ok());
    }

    #[test]
    fn bulk_fixed_all_or_nothing() {
        let ring: Ring<usize> = Ring::new(8, 0).unwrap();
        let objs: Vec<usize> = (0..5).collect();
        assert_eq!(ring.enqueue_bulk(&objs), 5);
        // Only 2 slots left: fixed refuses, burst takes what fits.
        assert_eq!(ring.enqueue_bulk(&objs), 0);
        assert_eq!(ring.enqueue_burst(&objs), 2);

        let mut out = [0usize; 8];
        assert_eq!(ring.dequeue_bulk(&mut out[..8]), 0);
        assert_eq!(ring.dequeue_burst(&mut out), 7);
        assert_eq!(&out[..7], &[0, 1, 2, 3, 4, 0, 1]);
    }

    #[test]
    fn mpmc_transfers_every_item_once() {
        const PER_PRODUCER: usize = 20_000;
        let ring: Arc<Ring<usize>> = Arc::new(Ring::new(1024, 0).unwrap());
        let mut handles = Vec::new();

        for p in 0..3 {
            let ring = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let val = p * PER_PRODUCER + i + 1;
                    while !ring.enqueue(val) {
                        std::hint::spin_loop();
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let ring = ring.clone();
            consumers.push(std::thread::spawn(move || {
                let mut sum = 0u64;
                let mut got = 0usize;
                while got < PER_PRODUCER {
                    if let Some(v) = ring.dequeue() {
                        sum += v as u64;
                        got += 1;
                    } else {
                        std::hint::spin_loop();
                    }
                }
                sum
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        let n = (3 * PER_PRODUCER) as u64;
        assert_eq!(total, n * (n + 1) / 2);
        assert!(ring.is_empty());
    }
}

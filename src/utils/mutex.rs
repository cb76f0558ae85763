// Futex-based sleeping mutex.
//
// `count` holds 1 when free, 0 when locked, and a negative value while
// contended. Waiters queue FIFO under a spinlock, each parked on its own
// futex word; unlock hands the word a tick and wakes the queue head.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::utils::futex::{futex_wait, futex_wake};
use crate::utils::get_thread_id;
use crate::utils::spinlock::SpinLock;

struct MutexWaiter {
    flags: AtomicU32,
}

pub struct RawMutex {
    count: AtomicI32,
    wait_list: SpinLock<VecDeque<NonNull<MutexWaiter>>>,
}

// Safety: queued waiter nodes live on their owner's stack until that owner
// removes them under the wait-list lock; they are only dereferenced with the
// lock held.
unsafe impl Send for RawMutex {}
unsafe impl Sync for RawMutex {}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RawMutex {
    pub const fn new() -> Self {
        Self {
            count: AtomicI32::new(1),
            wait_list: SpinLock::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self.count.fetch_sub(1, Ordering::Acquire) - 1 < 0 {
            self.lock_slow();
        }
    }

    #[inline]
    pub fn unlock(&self) {
        if self.count.fetch_add(1, Ordering::Release) + 1 < 1 {
            self.unlock_slow();
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        if self
            .count
            .compare_exchange(1, 0, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return true;
        }
        self.try_lock_slow()
    }

    pub fn is_locked(&self) -> bool {
        self.count.load(Ordering::SeqCst) < 1
    }

    #[cold]
    fn lock_slow(&self) {
        let waiter = MutexWaiter {
            flags: AtomicU32::new(0),
        };
        let wptr = NonNull::from(&waiter);

        let mut queue = self.wait_list.lock();
        queue.push_back(wptr);

        // Keep grabbing the contended state until the holder hands over a 1.
        while self.count.swap(-1, Ordering::Acquire) != 1 {
            drop(queue);
            futex_wait(&waiter.flags, 0, None);
            queue = self.wait_list.lock();
            waiter.flags.store(0, Ordering::SeqCst);
        }

        queue.retain(|w| *w != wptr);
        if queue.is_empty() {
            // No waiters left: downgrade from contended to plainly locked.
            self.count.store(0, Ordering::SeqCst);
        }
    }

    #[cold]
    fn unlock_slow(&self) {
        let queue = self.wait_list.lock();
        self.count.store(1, Ordering::SeqCst);
        if let Some(&first) = queue.front() {
            // Safety: nodes stay valid while linked, see the impl note.
            let waiter = unsafe { first.as_ref() };
            waiter.flags.fetch_add(1, Ordering::SeqCst);
            futex_wake(&waiter.flags, 1);
        }
    }

    #[cold]
    fn try_lock_slow(&self) -> bool {
        let queue = self.wait_list.lock();
        let prev = self.count.swap(-1, Ordering::Acquire);
        if queue.is_empty() {
            self.count.store(0, Ordering::SeqCst);
        }
        prev == 1
    }
}

/// A mutex protecting `T`.
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { lock: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the mutex.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the mutex.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

/// Mutex that may be re-acquired by its current owner.
pub struct RecursiveMutex {
    mutex: RawMutex,
    owner: AtomicI32,
    depth: UnsafeCell<u32>,
}

// Safety: `depth` is only touched by the thread that owns `mutex`.
unsafe impl Send for RecursiveMutex {}
unsafe impl Sync for RecursiveMutex {}

impl Default for RecursiveMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl RecursiveMutex {
    pub const fn new() -> Self {
        Self {
            mutex: RawMutex::new(),
            owner: AtomicI32::new(0),
            depth: UnsafeCell::new(0),
        }
    }

    pub fn lock(&self) {
        let tid = get_thread_id();
        if self.owner.load(Ordering::SeqCst) != tid {
            self.mutex.lock();
            self.owner.store(tid, Ordering::SeqCst);
        }
        unsafe { *self.depth.get() += 1 };
    }

    pub fn try_lock(&self) -> bool {
        let tid = get_thread_id();
        if self.owner.load(Ordering::SeqCst) != tid {
            if !self.mutex.try_lock() {
                return false;
            }
            self.owner.store(tid, Ordering::SeqCst);
        }
        unsafe { *self.depth.get() += 1 };
        true
    }

    pub fn unlock(&self) {
        let tid = get_thread_id();
        assert_eq!(
            self.owner.load(Ordering::SeqCst),
            tid,
            "recursive unlock by non-owner"
        );
        let depth = unsafe { &mut *self.depth.get() };
        assert!(*depth > 0, "recursive unlock underflow");
        *depth -= 1;
        if *depth == 0 {
            self.owner.store(0, Ordering::SeqCst);
            self.mutex.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn uncontended_lock_cycle() {
        let m = RawMutex::new();
        assert!(!m.is_locked());
        m.lock();
        assert!(m.is_locked());
        assert!(!m.try_lock());
        m.unlock();
        assert!(m.try_lock());
        m.unlock();
        assert!(!m.is_locked());
    }

    #[test]
    fn contended_counter() {
        let m = Arc::new(Mutex::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..5_000 {
                    *m.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*m.lock(), 20_000);
    }

    #[test]
    fn recursive_depth() {
        let m = RecursiveMutex::new();
        m.lock();
        assert!(m.try_lock());
        m.unlock();
        m.unlock();
        // Fully released: another thread can take it now.
        let m = Arc::new(m);
        let m2 = m.clone();
        std::thread::spawn(move || {
            m2.lock();
            m2.unlock();
        })
        .join()
        .unwrap();
    }
}

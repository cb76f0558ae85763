// Queued spinlock.
//
// Bitfields in the 32-bit lock word:
//
//   0- 7: locked byte
//      8: pending
//   9-31: reserved for queue tail encoding
//
// (queue tail, pending bit, lock value)
//
//              fast     :    slow                                  :    unlock
//                       :                                          :
// uncontended  (0,0,0) -:--> (0,0,1) ------------------------------:--> (*,*,0)
//                       :       | ^--------.------.             /  :
//                       :       v           \      \            |  :
// pending               :    (0,1,1) +--> (0,1,0)   \           |  :
//                       :       | ^--'              |           |  :
//                       :       v                   |           |  :
// contended             :    (*,x,y) +--> (*,0,0) ---> (*,0,1) -'  :
//   queue               :         ^--'                             :
//
// Contenders past the pending holder spin for the hand-over and retry the
// uncontended CAS; the tail bits stay reserved.

use crossbeam::utils::Backoff;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, Ordering};

const LOCKED: u32 = 1;
const LOCKED_MASK: u32 = 0xff;
const PENDING: u32 = 1 << 8;

/// Bounded uncontended attempts before entering the slow path.
const MAX_CONTENDS: u32 = 64;

pub struct RawSpinLock {
    val: AtomicU32,
}

impl Default for RawSpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpinLock {
    pub const fn new() -> Self {
        Self {
            val: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.val
            .compare_exchange(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.val.load(Ordering::Relaxed) & LOCKED_MASK != 0
    }

    #[inline]
    pub fn lock(&self) {
        let mut spins = MAX_CONTENDS;
        loop {
            match self
                .val
                .compare_exchange(0, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(val) => {
                    spins -= 1;
                    if spins == 0 {
                        return self.lock_slow(val);
                    }
                    self.spin_while(|v| v & LOCKED_MASK != 0);
                }
            }
        }
    }

    /// Release the lock. Only the locked byte is cleared; a pending waiter
    /// keeps its claim.
    #[inline]
    pub fn unlock(&self) {
        let prev = self.val.fetch_and(!LOCKED_MASK, Ordering::Release);
        debug_assert!(prev & LOCKED_MASK != 0, "unlock of unheld spinlock");
    }

    #[inline]
    fn spin_while<F: Fn(u32) -> bool>(&self, cond: F) -> u32 {
        let backoff = Backoff::new();
        loop {
            let val = self.val.load(Ordering::Acquire);
            if !cond(val) {
                return val;
            }
            backoff.snooze();
        }
    }

    #[cold]
    fn lock_slow(&self, mut val: u32) {
        'restart: loop {
            // Wait out an in-progress pending->locked hand-over.
            if val == PENDING {
                val = self.spin_while(|v| v == PENDING);
            }

            // trylock || pending:
            //   0,0,0 -> 0,0,1   take the lock outright
            //   0,0,1 -> 0,1,1   otherwise stake the pending claim
            let new;
            loop {
                if val & !LOCKED_MASK != 0 {
                    // Someone else already holds pending; spin for the
                    // hand-over then retry the uncontended CAS.
                    self.spin_while(|v| v & PENDING != 0);
                    match self.val.compare_exchange(
                        0,
                        LOCKED,
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(v) => {
                            val = v;
                            continue 'restart;
                        }
                    }
                }
                let mut want = LOCKED;
                if val == LOCKED {
                    want |= PENDING;
                }
                match self
                    .val
                    .compare_exchange(val, want, Ordering::Acquire, Ordering::Relaxed)
                {
                    Ok(_) => {
                        new = want;
                        break;
                    }
                    Err(v) => val = v,
                }
            }

            // Won the trylock outright.
            if new == LOCKED {
                return;
            }

            // We hold pending: wait for the owner to go away, then take
            // ownership and clear the pending bit in one step
            // (*,1,0 -> *,0,1).
            self.spin_while(|v| v & LOCKED_MASK != 0);
            self.val
                .fetch_add(LOCKED.wrapping_sub(PENDING), Ordering::AcqRel);
            return;
        }
    }
}

/// A spinlock protecting `T`, released through its RAII guard.
pub struct SpinLock<T: ?Sized> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.raw.lock();
        SpinGuard { lock: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

pub struct SpinGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the raw lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the raw lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_unlock() {
        let lock = RawSpinLock::new();
        lock.lock();
        assert!(lock.is_locked());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(!lock.is_locked());
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn guarded_counter_under_contention() {
        let counter = Arc::new(SpinLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let counter = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10_000 {
                    *counter.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 40_000);
    }
}

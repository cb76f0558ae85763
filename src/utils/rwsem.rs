// Reader/writer semaphore.
//
// `activity` counts the grant state: > 0 readers, 0 free, -1 one writer.
// Waiters queue FIFO tagged READ or WRITE; readers at the head of the queue
// are granted as a run, writers one at a time. Readers removed from the
// queue have already been counted into `activity` by their waker.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::utils::futex::{futex_wait, futex_wake};
use crate::utils::spinlock::SpinLock;

const WAITING_FOR_READ: u32 = 0x1000_0000;
const WAITING_FOR_WRITE: u32 = 0x2000_0000;
const WAITING_MASK: u32 = 0x0fff_ffff;

struct RwsemWaiter {
    flags: AtomicU32,
}

struct RwsemInner {
    activity: i32,
    list: VecDeque<NonNull<RwsemWaiter>>,
}

pub struct RwSem {
    inner: SpinLock<RwsemInner>,
}

// Safety: waiter nodes live on their owner's stack for as long as they are
// linked; all linkage and dereferencing happens under the inner spinlock.
unsafe impl Send for RwSem {}
unsafe impl Sync for RwSem {}

fn wake_waiter(waiter: &RwsemWaiter) {
    waiter.flags.fetch_add(1, Ordering::SeqCst);
    futex_wake(&waiter.flags, 1);
}

impl Default for RwSem {
    fn default() -> Self {
        Self::new()
    }
}

impl RwSem {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(RwsemInner {
                activity: 0,
                list: VecDeque::new(),
            }),
        }
    }

    /// Snapshot of the grant state, for assertions.
    pub fn activity(&self) -> i32 {
        self.inner.lock().activity
    }

    pub fn down_read(&self) {
        let mut inner = self.inner.lock();

        // Readers win while the lock is read-held or free with nobody queued.
        if inner.activity > 0 || (inner.activity == 0 && inner.list.is_empty()) {
            inner.activity += 1;
            return;
        }

        let waiter = RwsemWaiter {
            flags: AtomicU32::new(WAITING_FOR_READ),
        };
        inner.list.push_back(NonNull::from(&waiter));

        loop {
            let flags = waiter.flags.load(Ordering::SeqCst);
            if flags & WAITING_MASK != 0 {
                // Woken: the waker granted us and unlinked the node.
                break;
            }
            drop(inner);
            futex_wait(&waiter.flags, flags, None);
            inner = self.inner.lock();
        }
    }

    pub fn try_down_read(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.activity >= 0 && inner.list.is_empty() {
            inner.activity += 1;
            true
        } else {
            false
        }
    }

    pub fn down_write(&self) {
        let mut inner = self.inner.lock();

        let waiter = RwsemWaiter {
            flags: AtomicU32::new(WAITING_FOR_WRITE),
        };
        let wptr = NonNull::from(&waiter);
        inner.list.push_back(wptr);

        while inner.activity != 0 {
            let flags = waiter.flags.load(Ordering::SeqCst);
            drop(inner);
            futex_wait(&waiter.flags, flags, None);
            inner = self.inner.lock();
            waiter.flags.store(WAITING_FOR_WRITE, Ordering::SeqCst);
        }
        inner.activity = -1;
        inner.list.retain(|w| *w != wptr);
    }

    pub fn try_down_write(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.activity == 0 {
            inner.activity = -1;
            true
        } else {
            false
        }
    }

    pub fn up_read(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.activity > 0, "up_read without readers");
        inner.activity -= 1;
        // A non-empty queue here can only lead with a writer.
        if inner.activity == 0 {
            if let Some(&first) = inner.list.front() {
                let waiter = unsafe { first.as_ref() };
                debug_assert!(waiter.flags.load(Ordering::SeqCst) & WAITING_FOR_WRITE != 0);
                wake_waiter(waiter);
            }
        }
    }

    pub fn up_write(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.activity, -1, "up_write without the writer");
        inner.activity = 0;
        if !inner.list.is_empty() {
            Self::do_wake(&mut inner, true);
        }
    }

    /// Turn the held write lock into a read lock, waking the reader run
    /// queued behind us (but no writer).
    pub fn downgrade_write(&self) {
        let mut inner = self.inner.lock();
        assert_eq!(inner.activity, -1, "downgrade without the writer");
        inner.activity = 1;
        if !inner.list.is_empty() {
            Self::do_wake(&mut inner, false);
        }
    }

    fn do_wake(inner: &mut RwsemInner, wakewrite: bool) {
        let first = *inner.list.front().expect("do_wake on empty queue");
        // Safety: linked nodes are valid, see the impl note.
        let waiter = unsafe { first.as_ref() };

        if waiter.flags.load(Ordering::SeqCst) & WAITING_FOR_WRITE != 0 {
            if wakewrite {
                // The writer unlinks itself once it claims `activity`.
                wake_waiter(waiter);
            }
            return;
        }

        // Grant the whole run of readers at the front of the queue.
        let mut woken = 0;
        while let Some(&w) = inner.list.front() {
            let waiter = unsafe { w.as_ref() };
            if waiter.flags.load(Ordering::SeqCst) & WAITING_FOR_READ == 0 {
                break;
            }
            inner.list.pop_front();
            wake_waiter(waiter);
            woken += 1;
        }
        inner.activity += woken;
    }

    pub fn read(&self) -> RwSemReadGuard<'_> {
        self.down_read();
        RwSemReadGuard { sem: self }
    }

    pub fn write(&self) -> RwSemWriteGuard<'_> {
        self.down_write();
        RwSemWriteGuard { sem: self }
    }
}

pub struct RwSemReadGuard<'a> {
    sem: &'a RwSem,
}

impl Drop for RwSemReadGuard<'_> {
    fn drop(&mut self) {
        self.sem.up_read();
    }
}

pub struct RwSemWriteGuard<'a> {
    sem: &'a RwSem,
}

impl<'a> RwSemWriteGuard<'a> {
    pub fn downgrade(self) -> RwSemReadGuard<'a> {
        let sem = self.sem;
        std::mem::forget(self);
        sem.downgrade_write();
        RwSemReadGuard { sem }
    }
}

impl Drop for RwSemWriteGuard<'_> {
    fn drop(&mut self) {
        self.sem.up_write();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn readers_share_writers_exclude() {
        let sem = RwSem::new();
        sem.down_read();
        sem.down_read();
        assert_eq!(sem.activity(), 2);
        assert!(!sem.try_down_write());
        sem.up_read();
        sem.up_read();
        assert!(sem.try_down_write());
        assert!(!sem.try_down_read());
        sem.up_write();
    }

    #[test]
    fn writer_blocks_then_proceeds() {
        let sem = Arc::new(RwSem::new());
        let hits = Arc::new(AtomicUsize::new(0));

        sem.down_read();
        let (s, h) = (sem.clone(), hits.clone());
        let writer = std::thread::spawn(move || {
            s.down_write();
            h.fetch_add(1, Ordering::SeqCst);
            s.up_write();
        });
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        sem.up_read();
        writer.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sem.activity(), 0);
    }

    #[test]
    fn exclusion_invariant_under_load() {
        let sem = Arc::new(RwSem::new());
        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for i in 0..6 {
            let (sem, readers, writers) = (sem.clone(), readers.clone(), writers.clone());
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if i % 3 == 0 {
                        sem.down_write();
                        assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                        assert_eq!(readers.load(Ordering::SeqCst), 0);
                        writers.fetch_sub(1, Ordering::SeqCst);
                        sem.up_write();
                    } else {
                        sem.down_read();
                        readers.fetch_add(1, Ordering::SeqCst);
                        assert_eq!(writers.load(Ordering::SeqCst), 0);
                        readers.fetch_sub(1, Ordering::SeqCst);
                        sem.up_read();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(sem.activity(), 0);
    }

    #[test]
    fn downgrade_admits_readers() {
        let sem = RwSem::new();
        sem.down_write();
        sem.downgrade_write();
        assert!(sem.try_down_read());
        sem.up_read();
        sem.up_read();
        assert_eq!(sem.activity(), 0);
    }
}

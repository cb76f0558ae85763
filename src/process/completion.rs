// Completions.
//
// A wait queue plus a `done` counter manipulated under the queue lock.
// `complete(n)` banks n units and wakes up to n exclusive waiters; each
// successful wait consumes one unit, so completions that happened first
// never block a later waiter.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::process::wait::{WaitQueueEntry, WaitQueueHead};

pub struct Completion {
    wait: WaitQueueHead,
    done: AtomicU32,
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl Completion {
    pub const fn new() -> Self {
        Self {
            wait: WaitQueueHead::new(),
            done: AtomicU32::new(0),
        }
    }

    pub fn done(&self) -> u32 {
        self.done.load(Ordering::SeqCst)
    }

    /// Bank `n` units and wake up to `n` exclusive waiters.
    pub fn complete_n(&self, n: u32) {
        let mut list = self.wait.lock_list();
        self.done.fetch_add(n, Ordering::SeqCst);
        WaitQueueHead::wake_up_common(&mut list, n, None);
    }

    pub fn complete(&self) {
        self.complete_n(1);
    }

    /// Consume one unit without blocking, if one is banked.
    pub fn try_wait(&self) -> bool {
        let _list = self.wait.lock_list();
        if self.done.load(Ordering::SeqCst) > 0 {
            self.done.fetch_sub(1, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Wait for one unit; `false` on timeout.
    pub fn wait_timeout(&self, timeout_ms: Option<u64>) -> bool {
        let entry = WaitQueueEntry::autoremove();

        let mut list = self.wait.lock_list();
        if self.done.load(Ordering::SeqCst) == 0 {
            WaitQueueHead::add_exclusive_locked(&mut list, &entry);
            loop {
                drop(list);
                let woken = entry.wait_on_timeout(timeout_ms);
                list = self.wait.lock_list();
                if !woken {
                    WaitQueueHead::remove_locked(&mut list, &entry);
                    return false;
                }
                if self.done.load(Ordering::SeqCst) != 0 {
                    break;
                }
            }
            WaitQueueHead::remove_locked(&mut list, &entry);
        }
        self.done.fetch_sub(1, Ordering::SeqCst);
        true
    }

    pub fn wait(&self) {
        self.wait_timeout(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn complete_before_wait_does_not_block() {
        let c = Completion::new();
        c.complete();
        assert!(c.wait_timeout(Some(0)));
        assert_eq!(c.done(), 0);
    }

    #[test]
    fn wait_times_out_without_completion() {
        let c = Completion::new();
        assert!(!c.wait_timeout(Some(20)));
        assert_eq!(c.done(), 0);
    }

    #[test]
    fn units_are_consumed_one_per_wait() {
        let c = Completion::new();
        c.complete_n(3);
        assert!(c.try_wait());
        assert!(c.wait_timeout(Some(0)));
        assert!(c.wait_timeout(Some(0)));
        assert!(!c.try_wait());
    }

    #[test]
    fn cross_thread_handoff() {
        let c = Arc::new(Completion::new());
        let c2 = c.clone();
        let t = std::thread::spawn(move || {
            c2.wait();
            1u32
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        c.complete();
        assert_eq!(t.join().unwrap(), 1);
    }
}

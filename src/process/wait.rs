// Wait queues and bit-waits.
//
// A waiter carries a monotonic counter used as its futex word plus a
// snapshot of the last value it observed; `wait_on_timeout` sleeps only
// when nothing changed since the snapshot. Wakers walk the queue under its
// spinlock invoking each waiter's wake function; a successful wake of an
// EXCLUSIVE waiter consumes one unit of the wake budget.
//
// Waiter nodes live on their owner's stack. They must be unlinked (by
// `finish_wait` / `remove`, or by an autoremove wake) before the owning
// frame returns; all linkage happens under the queue lock.

use once_cell::sync::Lazy;
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::utils::bitops::{hash_long, test_and_set_bit, test_bit};
use crate::utils::futex::{futex_wait, futex_wake};
use crate::utils::spinlock::{SpinGuard, SpinLock};

pub const WQ_FLAG_EXCLUSIVE: u32 = 0x01;

/// Key identifying one bit of one word, matched exactly by bit wake-ups so
/// hash collisions in the bit-wait table cannot wake the wrong waiter.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct BitKey {
    pub word: *const AtomicUsize,
    pub bit: usize,
}

pub struct WakeOutcome {
    pub woken: bool,
    pub remove: bool,
}

pub type WakeFn = fn(&WaitQueueEntry, Option<&BitKey>) -> WakeOutcome;

pub struct WaitQueueEntry {
    flags: AtomicU32,
    cond: AtomicU32,
    last_cond: AtomicU32,
    linked: AtomicBool,
    func: WakeFn,
    bit_key: Option<BitKey>,
}

// Safety: the raw pointer inside `bit_key` is only dereferenced by the
// waiting thread and by wakers holding the queue lock.
unsafe impl Send for WaitQueueEntry {}
unsafe impl Sync for WaitQueueEntry {}

pub fn default_wake_function(entry: &WaitQueueEntry, _key: Option<&BitKey>) -> WakeOutcome {
    entry.cond.fetch_add(1, Ordering::SeqCst);
    WakeOutcome {
        woken: futex_wake(&entry.cond, 1) > 0,
        remove: false,
    }
}

pub fn autoremove_wake_function(entry: &WaitQueueEntry, key: Option<&BitKey>) -> WakeOutcome {
    let mut outcome = default_wake_function(entry, key);
    outcome.remove = outcome.woken;
    outcome
}

pub fn wake_bit_function(entry: &WaitQueueEntry, key: Option<&BitKey>) -> WakeOutcome {
    let key = key.expect("bit wake without a key");
    let own = entry.bit_key.as_ref().expect("bit waiter without a key");
    // Several (word, bit) pairs share a table slot; match exactly, and skip
    // waiters whose bit is still set.
    if own.word != key.word || own.bit != key.bit || test_bit(key.bit, unsafe { &*key.word }) {
        return WakeOutcome {
            woken: false,
            remove: false,
        };
    }
    autoremove_wake_function(entry, Some(key))
}

impl Default for WaitQueueEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueueEntry {
    /// A waiter that stays linked until removed explicitly.
    pub fn new() -> Self {
        Self::with_fn(default_wake_function)
    }

    /// A waiter unlinked by the wake that releases it.
    pub fn autoremove() -> Self {
        Self::with_fn(autoremove_wake_function)
    }

    fn with_fn(func: WakeFn) -> Self {
        Self {
            flags: AtomicU32::new(0),
            cond: AtomicU32::new(0),
            last_cond: AtomicU32::new(0),
            linked: AtomicBool::new(false),
            func,
            bit_key: None,
        }
    }

    fn for_bit(word: *const AtomicUsize, bit: usize) -> Self {
        let mut entry = Self::with_fn(wake_bit_function);
        entry.bit_key = Some(BitKey { word, bit });
        entry
    }

    pub fn is_exclusive(&self) -> bool {
        self.flags.load(Ordering::SeqCst) & WQ_FLAG_EXCLUSIVE != 0
    }

    /// Sleep until the waiter's counter moves past the last snapshot.
    /// Returns `false` on timeout.
    pub fn wait_on_timeout(&self, timeout_ms: Option<u64>) -> bool {
        let mut rc = true;
        let cond = self.cond.load(Ordering::SeqCst);
        if cond == self.last_cond.load(Ordering::SeqCst) {
            rc = futex_wait(&self.cond, cond, timeout_ms);
        }
        self.last_cond.store(self.cond.load(Ordering::SeqCst), Ordering::SeqCst);
        rc
    }

    pub fn wait_on(&self) {
        self.wait_on_timeout(None);
    }
}

pub(crate) type WaitList = VecDeque<NonNull<WaitQueueEntry>>;

pub struct WaitQueueHead {
    list: SpinLock<WaitList>,
}

// Safety: see WaitQueueEntry; nodes are only reached under the list lock.
unsafe impl Send for WaitQueueHead {}
unsafe impl Sync for WaitQueueHead {}

impl Default for WaitQueueHead {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitQueueHead {
    pub const fn new() -> Self {
        Self {
            list: SpinLock::new(VecDeque::new()),
        }
    }

    pub(crate) fn lock_list(&self) -> SpinGuard<'_, WaitList> {
        self.list.lock()
    }

    pub fn active(&self) -> bool {
        !self.list.lock().is_empty()
    }

    pub(crate) fn add_locked(list: &mut WaitList, entry: &WaitQueueEntry) {
        if !entry.linked.swap(true, Ordering::SeqCst) {
            list.push_front(NonNull::from(entry));
        }
    }

    pub(crate) fn add_exclusive_locked(list: &mut WaitList, entry: &WaitQueueEntry) {
        entry.flags.fetch_or(WQ_FLAG_EXCLUSIVE, Ordering::SeqCst);
        if !entry.linked.swap(true, Ordering::SeqCst) {
            list.push_back(NonNull::from(entry));
        }
    }

    pub(crate) fn remove_locked(list: &mut WaitList, entry: &WaitQueueEntry) {
        if entry.linked.swap(false, Ordering::SeqCst) {
            let ptr = NonNull::from(entry);
            list.retain(|e| *e != ptr);
        }
    }

    pub fn add(&self, entry: &WaitQueueEntry) {
        Self::add_locked(&mut self.list.lock(), entry);
    }

    pub fn add_exclusive(&self, entry: &WaitQueueEntry) {
        Self::add_exclusive_locked(&mut self.list.lock(), entry);
    }

    pub fn remove(&self, entry: &WaitQueueEntry) {
        Self::remove_locked(&mut self.list.lock(), entry);
    }

    /// Queue the waiter (non-exclusive, at the head) ahead of a condition
    /// re-check.
    pub fn prepare_to_wait(&self, entry: &WaitQueueEntry) {
        entry.flags.fetch_and(!WQ_FLAG_EXCLUSIVE, Ordering::SeqCst);
        self.add(entry);
    }

    /// Queue the waiter exclusive, at the tail.
    pub fn prepare_to_wait_exclusive(&self, entry: &WaitQueueEntry) {
        self.add_exclusive(entry);
    }

    /// Unlink after the wait, wherever the wake left the entry.
    pub fn finish_wait(&self, entry: &WaitQueueEntry) {
        if entry.linked.load(Ordering::SeqCst) {
            self.remove(entry);
        }
    }

    pub(crate) fn wake_up_common(list: &mut WaitList, nr: u32, key: Option<&BitKey>) {
        let mut budget = nr;
        let mut i = 0;
        while i < list.len() {
            // Safety: linked entries are alive; we hold the list lock.
            let entry = unsafe { list[i].as_ref() };
            let exclusive = entry.is_exclusive();
            let outcome = (entry.func)(entry, key);
            if outcome.remove {
                entry.linked.store(false, Ordering::SeqCst);
                list.remove(i);
            } else {
                i += 1;
            }
            if outcome.woken && exclusive {
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
        }
    }

    /// Wake waiters: every non-exclusive one walked plus up to `nr`
    /// exclusive ones.
    pub fn wake_up(&self, nr: u32) {
        Self::wake_up_common(&mut self.list.lock(), nr, None);
    }

    pub fn wake_up_all(&self) {
        Self::wake_up_common(&mut self.list.lock(), u32::MAX, None);
    }
}

// ============================================================================
// Bit-waits
// ============================================================================

const BIT_WAIT_BITS: u32 = 6;
const BIT_WAIT_SIZE: usize = 1 << BIT_WAIT_BITS;

static BIT_WAIT_TABLE: Lazy<Vec<WaitQueueHead>> =
    Lazy::new(|| (0..BIT_WAIT_SIZE).map(|_| WaitQueueHead::new()).collect());

fn bit_waitqueue(word: *const AtomicUsize, bit: usize) -> &'static WaitQueueHead {
    let shift = if usize::BITS == 32 { 5 } else { 6 };
    let val = ((word as usize) << shift) | bit;
    &BIT_WAIT_TABLE[hash_long(val as u64, BIT_WAIT_BITS) as usize]
}

fn wait_on_bit_common(word: &AtomicUsize, bit: usize, lock: bool) {
    let wq = bit_waitqueue(word, bit);
    let entry = WaitQueueEntry::for_bit(word, bit);
    if lock {
        entry.flags.fetch_or(WQ_FLAG_EXCLUSIVE, Ordering::SeqCst);
    }

    loop {
        {
            let mut list = wq.lock_list();
            if lock {
                WaitQueueHead::add_exclusive_locked(&mut list, &entry);
            } else {
                WaitQueueHead::add_locked(&mut list, &entry);
            }
        }

        if test_bit(bit, word) {
            entry.wait_on();
        }

        let busy = if lock {
            test_and_set_bit(bit, word)
        } else {
            test_bit(bit, word)
        };
        if !busy {
            break;
        }
    }
    wq.finish_wait(&entry);
}

/// Wait until `bit` of `word` is clear.
pub fn wait_on_bit(word: &AtomicUsize, bit: usize) {
    if !test_bit(bit, word) {
        return;
    }
    wait_on_bit_common(word, bit, false);
}

/// Wait until `bit` of `word` is clear, then atomically set it.
pub fn wait_on_bit_lock(word: &AtomicUsize, bit: usize) {
    if !test_and_set_bit(bit, word) {
        return;
    }
    wait_on_bit_common(word, bit, true);
}

/// Wake one waiter parked on `(word, bit)`; call after clearing the bit.
pub fn wake_up_bit(word: &AtomicUsize, bit: usize) {
    let wq = bit_waitqueue(word, bit);
    if wq.active() {
        let key = BitKey { word, bit };
        WaitQueueHead::wake_up_common(&mut wq.lock_list(), 1, Some(&key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::bitops::clear_bit;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wake_up_releases_waiter() {
        let q = Arc::new(WaitQueueHead::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (q2, hits2) = (q.clone(), hits.clone());

        let t = std::thread::spawn(move || {
            let entry = WaitQueueEntry::new();
            q2.prepare_to_wait(&entry);
            entry.wait_on();
            hits2.fetch_add(1, Ordering::SeqCst);
            q2.finish_wait(&entry);
        });

        while !q.active() {
            std::thread::yield_now();
        }
        q.wake_up_all();
        t.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!q.active());
    }

    #[test]
    fn wait_on_timeout_reports_timeout() {
        let entry = WaitQueueEntry::new();
        assert!(!entry.wait_on_timeout(Some(20)));
        // A wake between snapshots shows up as an immediate success.
        entry.cond.fetch_add(1, Ordering::SeqCst);
        assert!(entry.wait_on_timeout(Some(1000)));
    }

    #[test]
    fn exclusive_budget_wakes_one() {
        let q = Arc::new(WaitQueueHead::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::new();
        for _ in 0..3 {
            let (q2, hits2) = (q.clone(), hits.clone());
            threads.push(std::thread::spawn(move || {
                let entry = WaitQueueEntry::autoremove();
                q2.prepare_to_wait_exclusive(&entry);
                entry.wait_on();
                hits2.fetch_add(1, Ordering::SeqCst);
                q2.finish_wait(&entry);
            }));
        }
        while q.lock_list().len() < 3 {
            std::thread::yield_now();
        }
        // Let all three park in the futex before spending the budget.
        std::thread::sleep(Duration::from_millis(50));
        q.wake_up(1);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        q.wake_up(2);
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn bit_lock_hands_over() {
        let word = Arc::new(AtomicUsize::new(0));
        wait_on_bit_lock(&word, 2);
        assert!(test_bit(2, &word));

        let w2 = word.clone();
        let t = std::thread::spawn(move || {
            wait_on_bit_lock(&w2, 2);
            // Inherit, then release.
            clear_bit(2, &w2);
            wake_up_bit(&w2, 2);
        });

        std::thread::sleep(Duration::from_millis(20));
        clear_bit(2, &word);
        wake_up_bit(&word, 2);
        t.join().unwrap();
        wait_on_bit(&word, 2);
        assert!(!test_bit(2, &word));
    }
}

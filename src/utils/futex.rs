// Futex-style blocking primitive.
//
// On Linux the private futex syscall is used directly. Elsewhere a
// fixed-size table of (mutex, condvar, waiter count) tuples hashed by the
// word's address stands in; hash collisions coalesce wake-ups across keys,
// which is harmless because every waiter rechecks its word.
//
// A spurious wake is always permitted; a spurious missed wake is not.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::config;
use crate::process::workqueue;

/// Wait until `*word != expected` or a wake arrives.
///
/// Returns `true` when the word changed or the waiter was woken (including
/// spuriously) and `false` on timeout. `None` means wait forever.
pub fn futex_wait(word: &AtomicU32, expected: u32, timeout_ms: Option<u64>) -> bool {
    if word.load(Ordering::SeqCst) != expected {
        return true;
    }
    workqueue::worker_sleeping();
    let rc = imp::wait(word, expected, timeout_ms);
    workqueue::worker_waking_up();
    rc
}

/// Wake up to `n` waiters parked on `word`; `n == 0` means "a CPU's worth".
/// Returns the number woken, best-effort.
pub fn futex_wake(word: &AtomicU32, n: usize) -> usize {
    let n = if n == 0 { config::nr_cpus() } else { n };
    imp::wake(word, n)
}

/// Poll-wait until the word reaches `until`, sleeping 50ms per probe for at
/// most `tries` probes.
pub fn futex_cond_wait(word: &AtomicU32, until: u32, mut tries: u32) -> bool {
    loop {
        let old = word.load(Ordering::SeqCst);
        if old == until {
            return true;
        }
        futex_wait(word, old, Some(50));
        if tries == 0 {
            return false;
        }
        tries -= 1;
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use std::sync::atomic::AtomicU32;

    fn futex_op(
        word: &AtomicU32,
        op: libc::c_int,
        val: u32,
        timeout: *const libc::timespec,
    ) -> libc::c_long {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word as *const AtomicU32 as *mut u32,
                op,
                val,
                timeout,
                std::ptr::null_mut::<u32>(),
                0u32,
            )
        }
    }

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout_ms: Option<u64>) -> bool {
        let ts;
        let mut ts_ptr: *const libc::timespec = std::ptr::null();
        if let Some(ms) = timeout_ms {
            ts = libc::timespec {
                tv_sec: (ms / 1000) as libc::time_t,
                tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
            };
            ts_ptr = &ts;
        }
        loop {
            let rc = futex_op(word, libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG, expected, ts_ptr);
            if rc >= 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                // The word changed under us.
                Some(libc::EAGAIN) => return true,
                Some(libc::ETIMEDOUT) => return false,
                Some(libc::EINTR) => continue,
                err => panic!("futex wait failed: {:?}", err),
            }
        }
    }

    pub(super) fn wake(word: &AtomicU32, n: usize) -> usize {
        let rc = futex_op(
            word,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n.min(i32::MAX as usize) as u32,
            std::ptr::null(),
        );
        assert!(rc >= 0, "futex wake failed");
        rc as usize
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;
    use crate::utils::bitops::hash_ptr;
    use parking_lot::{Condvar, Mutex};
    use std::time::Duration;

    const TABLE_SHIFT: u32 = 6;
    const TABLE_SIZE: usize = 1 << TABLE_SHIFT;

    struct Entry {
        waiters: Mutex<usize>,
        cond: Condvar,
    }

    static TABLE: once_cell::sync::Lazy<Vec<Entry>> = once_cell::sync::Lazy::new(|| {
        (0..TABLE_SIZE)
            .map(|_| Entry {
                waiters: Mutex::new(0),
                cond: Condvar::new(),
            })
            .collect()
    });

    fn entry_for(word: &AtomicU32) -> &'static Entry {
        &TABLE[hash_ptr(word as *const AtomicU32, TABLE_SHIFT) as usize]
    }

    pub(super) fn wait(word: &AtomicU32, expected: u32, timeout_ms: Option<u64>) -> bool {
        let entry = entry_for(word);
        let mut guard = entry.waiters.lock();
        *guard += 1;
        let mut woken = true;
        while word.load(Ordering::SeqCst) == expected {
            match timeout_ms {
                Some(ms) => {
                    if entry
                        .cond
                        .wait_for(&mut guard, Duration::from_millis(ms))
                        .timed_out()
                    {
                        woken = false;
                        break;
                    }
                }
                None => entry.cond.wait(&mut guard),
            }
        }
        *guard -= 1;
        woken
    }

    pub(super) fn wake(word: &AtomicU32, n: usize) -> usize {
        let entry = entry_for(word);
        let guard = entry.waiters.lock();
        let waiters = *guard;
        if waiters > 1 && n > 1 {
            entry.cond.notify_all();
        } else if waiters >= 1 {
            entry.cond.notify_one();
        }
        drop(guard);
        waiters.min(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn wait_returns_when_value_differs() {
        let word = AtomicU32::new(1);
        assert!(futex_wait(&word, 0, None));
    }

    #[test]
    fn wait_times_out() {
        let word = AtomicU32::new(0);
        let start = Instant::now();
        assert!(!futex_wait(&word, 0, Some(30)));
        assert!(start.elapsed().as_millis() >= 20);
    }

    #[test]
    fn wake_releases_waiter() {
        let word = Arc::new(AtomicU32::new(0));
        let w = word.clone();
        let handle = std::thread::spawn(move || {
            while w.load(Ordering::SeqCst) == 0 {
                futex_wait(&w, 0, Some(1000));
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        word.store(1, Ordering::SeqCst);
        futex_wake(&word, 1);
        handle.join().unwrap();
    }
}

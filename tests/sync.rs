// Synchronization stack scenarios: the completion ping-pong protocol,
// mutex exclusion and hand-off, rwsem writer/reader exclusion, bit-wait
// hand-over.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use ukern::process::{uthread_create, Completion};
use ukern::utils::bitops::{clear_bit, test_bit};
use ukern::utils::{Mutex, RwSem};

#[test]
fn completion_ping_pong() {
    const ROUNDS: usize = 2_000;

    let count_a = Arc::new(AtomicUsize::new(0));
    let count_b = Arc::new(AtomicUsize::new(0));
    let complete_a = Arc::new(Completion::new());
    let complete_b = Arc::new(Completion::new());

    let partner_a = {
        let (ca, cb) = (count_a.clone(), count_b.clone());
        let (da, db) = (complete_a.clone(), complete_b.clone());
        uthread_create(move |_| {
            for _ in 0..ROUNDS {
                db.complete();
                da.wait();
                let a = ca.fetch_add(1, Ordering::SeqCst) + 1;
                assert_eq!(a, cb.load(Ordering::SeqCst), "A observed a skewed round");
            }
            0
        })
        .unwrap()
    };
    let partner_b = {
        let (ca, cb) = (count_a.clone(), count_b.clone());
        let (da, db) = (complete_a.clone(), complete_b.clone());
        uthread_create(move |_| {
            for _ in 0..ROUNDS {
                db.wait();
                let b = cb.fetch_add(1, Ordering::SeqCst);
                assert_eq!(b, ca.load(Ordering::SeqCst), "B observed a skewed round");
                da.complete();
            }
            0
        })
        .unwrap()
    };

    partner_b.wakeup().unwrap();
    partner_a.wakeup().unwrap();
    partner_a.stop().unwrap();
    partner_b.stop().unwrap();

    assert_eq!(count_a.load(Ordering::SeqCst), ROUNDS);
    assert_eq!(count_b.load(Ordering::SeqCst), ROUNDS);
}

#[test]
fn mutex_exclusion_under_contention() {
    let lock = Arc::new(Mutex::new((0u64, 0u64)));
    let mut threads = Vec::new();
    for _ in 0..6 {
        let lock = lock.clone();
        threads.push(std::thread::spawn(move || {
            for _ in 0..10_000 {
                let mut guard = lock.lock();
                // Both halves move together or the lock is broken.
                guard.0 += 1;
                guard.1 += 1;
                assert_eq!(guard.0, guard.1);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    let guard = lock.lock();
    assert_eq!(*guard, (60_000, 60_000));
}

#[test]
fn mutex_handoff_wakes_waiter() {
    let lock = Arc::new(Mutex::new(0u32));
    let guard = lock.lock();
    let l2 = lock.clone();
    let waiter = std::thread::spawn(move || {
        *l2.lock() += 1;
    });
    std::thread::sleep(std::time::Duration::from_millis(30));
    drop(guard);
    waiter.join().unwrap();
    assert_eq!(*lock.lock(), 1);
}

#[test]
fn rwsem_writer_excludes_everyone() {
    let sem = Arc::new(RwSem::new());
    let readers = Arc::new(AtomicUsize::new(0));
    let writers = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for i in 0..8 {
        let (sem, readers, writers) = (sem.clone(), readers.clone(), writers.clone());
        threads.push(std::thread::spawn(move || {
            for _ in 0..1_000 {
                if i % 4 == 0 {
                    let _w = sem.write();
                    assert_eq!(writers.fetch_add(1, Ordering::SeqCst), 0);
                    assert_eq!(readers.load(Ordering::SeqCst), 0);
                    writers.fetch_sub(1, Ordering::SeqCst);
                } else {
                    let _r = sem.read();
                    readers.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(writers.load(Ordering::SeqCst), 0);
                    readers.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert_eq!(sem.activity(), 0);
}

#[test]
fn bit_wait_lock_serializes_holders() {
    let word = Arc::new(AtomicUsize::new(0));
    let holders = Arc::new(AtomicUsize::new(0));

    let mut threads = Vec::new();
    for _ in 0..4 {
        let (word, holders) = (word.clone(), holders.clone());
        threads.push(std::thread::spawn(move || {
            for _ in 0..200 {
                ukern::process::wait_on_bit_lock(&word, 5);
                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                holders.fetch_sub(1, Ordering::SeqCst);
                clear_bit(5, &word);
                ukern::process::wake_up_bit(&word, 5);
            }
        }));
    }
    for t in threads {
        t.join().unwrap();
    }
    assert!(!test_bit(5, &word));
}

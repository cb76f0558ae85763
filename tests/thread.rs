// Thread lifecycle: paused creation, wakeup handshake, cooperative stop,
// and stack recycling under churn.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ukern::process::{tlsclnr_register, uthread_create, uthread_run};

#[test]
fn wakeup_returns_only_once_running() {
    let stage = Arc::new(AtomicUsize::new(0));
    let s2 = stage.clone();
    let t = uthread_create(move |me| {
        s2.store(1, Ordering::SeqCst);
        while !me.should_stop() {
            std::thread::sleep(Duration::from_millis(1));
        }
        17
    })
    .unwrap();

    t.wakeup().unwrap();
    // RUNNING was observed before wakeup returned; the store raced at most
    // a few instructions behind.
    assert!(t.is_running());
    assert_eq!(t.stop().unwrap(), 17);
    assert_eq!(stage.load(Ordering::SeqCst), 1);
}

#[test]
fn double_stop_is_refused() {
    let t = uthread_run(|_| 0).unwrap();
    t.stop().unwrap();
    assert!(t.stop().is_err());
}

#[test]
fn heavy_churn_reuses_pooled_stacks() {
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let batch: Vec<_> = (0..6)
            .map(|_| {
                let counter = counter.clone();
                uthread_run(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    0
                })
                .unwrap()
            })
            .collect();
        for t in batch {
            t.stop().unwrap();
        }
    }
    assert_eq!(counter.load(Ordering::SeqCst), 48);
}

#[test]
fn tls_cleanup_runs_in_lifo_order() {
    let order = Arc::new(ukern::utils::SpinLock::new(Vec::new()));
    let o2 = order.clone();
    let t = uthread_run(move |_| {
        for tag in 0..3 {
            let order = o2.clone();
            tlsclnr_register(move || {
                order.lock().push(tag);
            });
        }
        0
    })
    .unwrap();
    t.stop().unwrap();
    assert_eq!(*order.lock(), vec![2, 1, 0]);
}

// Ring buffer scenarios: exact-size saturation over a thread pair, FIFO
// identity, and bulk round trips.

use std::sync::Arc;
use ukern::process::{uthread_create, uthread_run};
use ukern::ring::{Ring, RING_F_EXACT_SZ, RING_F_SC_DEQ, RING_F_SP_ENQ};

#[test]
fn exact_size_spsc_saturation() {
    let ring: Ring<usize> =
        Ring::new(127, RING_F_EXACT_SZ | RING_F_SP_ENQ | RING_F_SC_DEQ).unwrap();
    assert_eq!(ring.capacity(), 127);

    for i in 0..127 {
        assert!(ring.enqueue(i), "slot {} refused", i);
    }
    assert!(!ring.enqueue(127), "128th enqueue must fail");
    assert!(ring.is_full());

    for i in 0..127 {
        assert_eq!(ring.dequeue(), Some(i));
    }
    assert_eq!(ring.dequeue(), None, "128th dequeue must fail");
    assert!(ring.is_empty());
}

#[test]
fn spsc_cross_thread_identity() {
    const COUNT: usize = 1 << 16;
    let ring: Arc<Ring<usize>> = Arc::new(
        Ring::new(127, RING_F_EXACT_SZ | RING_F_SP_ENQ | RING_F_SC_DEQ).unwrap(),
    );

    let consumer = {
        let ring = ring.clone();
        uthread_create(move |_| {
            for expect in 0..COUNT {
                loop {
                    if let Some(got) = ring.dequeue() {
                        assert_eq!(got, expect);
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
            0
        })
        .unwrap()
    };
    let producer = {
        let ring = ring.clone();
        uthread_run(move |_| {
            for i in 0..COUNT {
                while !ring.enqueue(i) {
                    std::hint::spin_loop();
                }
            }
            0
        })
        .unwrap()
    };
    consumer.wakeup().unwrap();

    producer.stop().unwrap();
    consumer.stop().unwrap();
    assert!(ring.is_empty());
}

#[test]
fn bulk_round_trip_is_identity() {
    let ring: Ring<u64> = Ring::new(64, 0).unwrap();
    let src: Vec<u64> = (100..140).collect();
    assert_eq!(ring.enqueue_bulk(&src), 40);

    let mut out = vec![0u64; 40];
    assert_eq!(ring.dequeue_bulk(&mut out), 40);
    assert_eq!(out, src);
}

#[test]
fn burst_reports_partial_transfers() {
    let ring: Ring<u64> = Ring::new(8, 0).unwrap();
    let src: Vec<u64> = (0..10).collect();
    // FIXED refuses what cannot fit wholesale; BURST moves the remainder.
    assert_eq!(ring.enqueue_bulk(&src), 0);
    assert_eq!(ring.enqueue_burst(&src), 7);
    assert_eq!(ring.free_space(), 0);

    let mut out = vec![0u64; 10];
    assert_eq!(ring.dequeue_burst(&mut out), 7);
    assert_eq!(&out[..7], &src[..7]);
}

#[test]
fn free_space_and_len_track_occupancy() {
    let ring: Ring<usize> = Ring::new(16, 0).unwrap();
    assert_eq!(ring.free_space(), 15);
    assert_eq!(ring.len(), 0);
    for i in 0..10 {
        ring.enqueue(i);
    }
    assert_eq!(ring.len(), 10);
    assert_eq!(ring.free_space(), 5);

    let mut out = vec![0usize; 4];
    let (n, available) = ring.dequeue_bulk_available(&mut out);
    assert_eq!(n, 4);
    assert_eq!(available, 6);
    assert_eq!(ring.len(), 6);
}

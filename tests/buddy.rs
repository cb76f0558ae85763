// Page allocator end-to-end behavior: compound identity, accounting
// restoration, and the per-zone freelist invariant under churn.

use ukern::config::{MAX_ORDER, VPAGE_SIZE};
use ukern::mm::zone::{
    alloc_pages, assert_zone_consistent, compound_head, compound_order, free_pages,
    nr_online_nodes, page_to_virt, setup_memory, virt_to_page, zone_free_counts, GFP_COMP,
    GFP_ZERO,
};

fn zone_guard() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

#[test]
fn compound_alloc_basics() {
    let _g = zone_guard();
    setup_memory();

    let head = alloc_pages(GFP_COMP, 3).expect("order-3 compound");
    let nid = head.nid();
    let before = zone_free_counts(nid);

    let base = page_to_virt(head);
    for i in 0..8 {
        let page = virt_to_page(unsafe { base.add(i * VPAGE_SIZE) }).expect("descriptor");
        assert!(std::ptr::eq(compound_head(page), head));
        assert_eq!(compound_order(page), 3);
    }

    free_pages(head, 3);
    assert_zone_consistent(nid);

    // Re-allocating the same order leaves the books where they were.
    let again = alloc_pages(GFP_COMP, 3).expect("order-3 compound");
    let after = zone_free_counts(again.nid());
    if again.nid() == nid {
        assert_eq!(after.1, before.1);
    }
    free_pages(again, 3);
}

#[test]
fn alloc_free_pairs_preserve_totals() {
    let _g = zone_guard();
    setup_memory();
    let probe = alloc_pages(0, 0).expect("probe page");
    let nid = probe.nid();
    let (_, free_before) = zone_free_counts(nid);

    let mut held = Vec::new();
    for order in [0usize, 1, 2, 4, 6] {
        held.push((alloc_pages(0, order).expect("block"), order));
    }
    for (page, order) in held.into_iter().rev() {
        free_pages(page, order);
    }

    for n in 0..nr_online_nodes() {
        assert_zone_consistent(n);
    }
    let (_, free_after) = zone_free_counts(nid);
    assert_eq!(free_before, free_after);
    free_pages(probe, 0);
}

#[test]
fn randomized_churn_keeps_zones_balanced() {
    let _g = zone_guard();
    setup_memory();

    let mut held: Vec<(&ukern::mm::VPage, usize)> = Vec::new();
    for i in 0..512 {
        if !held.is_empty() && fastrand::u8(..) % 3 == 0 {
            let (page, order) = held.swap_remove(fastrand::usize(..held.len()));
            free_pages(page, order);
        } else {
            let order = fastrand::usize(..6);
            let gfp = if order > 0 && i % 2 == 0 { GFP_COMP } else { 0 };
            held.push((alloc_pages(gfp, order).expect("churn block"), order));
        }
    }
    for (page, order) in held {
        free_pages(page, order);
    }
    for n in 0..nr_online_nodes() {
        assert_zone_consistent(n);
    }
}

#[test]
fn zeroed_pages_are_zero() {
    let _g = zone_guard();
    setup_memory();
    let page = alloc_pages(GFP_ZERO, 1).expect("zeroed block");
    let bytes = unsafe { std::slice::from_raw_parts(page_to_virt(page), 2 * VPAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0));
    free_pages(page, 1);
}

#[test]
fn order_out_of_range_is_rejected() {
    let _g = zone_guard();
    setup_memory();
    assert!(alloc_pages(0, MAX_ORDER).is_err());
}

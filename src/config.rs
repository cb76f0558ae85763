// Runtime tunables.
//
// Buddy geometry is compile-time (the descriptor array and zone freelists
// are sized from it); everything else is resolved once per process from the
// environment, with the defaults below.

use once_cell::sync::Lazy;

// ============================================================================
// Compile-time buddy geometry
// ============================================================================

/// log2 of the virtual page size. 64 KiB pages; always >= the OS page size.
pub const VPAGE_SHIFT: usize = 16;
pub const VPAGE_SIZE: usize = 1 << VPAGE_SHIFT;

/// Free blocks span orders `0..MAX_ORDER`; the largest block is
/// `2^(MAX_ORDER-1)` pages.
pub const MAX_ORDER: usize = 11;

/// Pages in one memory-supply block: a single maximum-order buddy block.
pub const BUDDY_BLKPAGES: usize = 1 << (MAX_ORDER - 1);
pub const BUDDY_BLKSIZE: usize = BUDDY_BLKPAGES << VPAGE_SHIFT;

/// Pseudo-NUMA nodes partition the reserved window into equal pfn ranges.
pub const NODES_SHIFT: usize = 2;
pub const MAX_NUMNODES: usize = 1 << NODES_SHIFT;

pub const VPAGES_PER_NODE_SHIFT: usize = 17;
pub const VPAGES_PER_NODE: usize = 1 << VPAGES_PER_NODE_SHIFT;
pub const MAX_NR_VPAGES: usize = MAX_NUMNODES * VPAGES_PER_NODE;

/// Only zone 0 is populated today; the array keeps the node/zone shape.
pub const MAX_NR_ZONES: usize = 1;

const _: () = assert!(VPAGE_SIZE.is_power_of_two());
const _: () = assert!(VPAGES_PER_NODE.is_power_of_two());
// One supply block must fit a node window with room to spare.
const _: () = assert!(BUDDY_BLKPAGES * 2 <= VPAGES_PER_NODE);
// Node windows are committed in whole supply blocks.
const _: () = assert!(VPAGES_PER_NODE % BUDDY_BLKPAGES == 0);

// ============================================================================
// Process-wide tunables
// ============================================================================

/// Thread stack size drawn from the stack pool (excludes the guard page).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Logical CPUs the runtime shards per-CPU state over.
    pub nr_cpus: usize,
    /// Bytes per pooled thread stack (guard page added on top).
    pub stack_size: usize,
    /// Number of event loops started on demand.
    pub event_loops: usize,
    /// Unbound workqueue pools keep at least this many workers parked.
    pub wq_min_workers: usize,
    /// ... and never grow past this many.
    pub wq_max_workers: usize,
    /// Nominal RCU grace period in milliseconds.
    pub rcu_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            nr_cpus: cpus,
            stack_size: DEFAULT_STACK_SIZE,
            event_loops: cpus.min(4),
            wq_min_workers: 2,
            wq_max_workers: 64,
            rcu_interval_ms: 5,
        }
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

static CONFIG: Lazy<RuntimeConfig> = Lazy::new(|| {
    let mut cfg = RuntimeConfig::default();
    if let Some(n) = env_usize("UKERN_NR_CPUS") {
        cfg.nr_cpus = n.clamp(1, 4096);
    }
    if let Some(n) = env_usize("UKERN_STACK_SIZE") {
        // Keep pthread minimums and page granularity.
        cfg.stack_size = n.next_multiple_of(page_size()).max(64 * 1024);
    }
    if let Some(n) = env_usize("UKERN_EVENT_LOOPS") {
        cfg.event_loops = n.clamp(1, cfg.nr_cpus.max(1));
    }
    if let Some(n) = env_usize("UKERN_WQ_MAX_WORKERS") {
        cfg.wq_max_workers = n.clamp(cfg.wq_min_workers, 1024);
    }
    if let Some(n) = env_usize("UKERN_RCU_INTERVAL_MS") {
        cfg.rcu_interval_ms = n.clamp(1, 10_000) as u64;
    }
    cfg
});

/// The process-wide configuration, resolved on first use.
pub fn config() -> &'static RuntimeConfig {
    &CONFIG
}

/// Shorthand for `config().nr_cpus`.
pub fn nr_cpus() -> usize {
    config().nr_cpus
}

/// The OS page size (guard pages, stack alignment).
pub fn page_size() -> usize {
    static PAGE: Lazy<usize> = Lazy::new(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    });
    *PAGE
}

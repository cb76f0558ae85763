// Workqueues.
//
// A workqueue owns worker pools fed through MPMC rings: bound queues keep
// one pinned single-worker pool per CPU (which is what makes per-pool FIFO
// order hold), unbound queues share one pool whose worker count floats
// between a floor and a cap. A work item carries PENDING/RUNNING/DELAYED
// bits; queueing is test-and-set on PENDING so a work is on at most one
// ring at a time, while re-queueing from inside its own callback works
// because PENDING clears before the callback runs.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config;
use crate::error::Result;
use crate::process::completion::Completion;
use crate::process::thread::{self, UThread};
use crate::ring::Ring;
use crate::utils::bitops::{test_and_clear_bit, test_and_set_bit, test_bit, clear_bit, set_bit};
use crate::utils::futex::{futex_wait, futex_wake};
use crate::utils::spinlock::SpinLock;

pub const WORK_PENDING_BIT: usize = 0;
pub const WORK_RUNNING_BIT: usize = 1;
pub const WORK_DELAYED_BIT: usize = 2;

/// Ring capacity per pool; pushes spin when a burst overruns it.
const POOL_RING_SIZE: u32 = 1 << 13;
/// Idle workers park this long before considering teardown.
const WORKER_IDLE_TIMEOUT_MS: u64 = 2_000;

pub type WorkFn = Box<dyn Fn(&Arc<Work>) + Send + Sync>;

pub struct Work {
    flags: AtomicUsize,
    /// Pool of the most recent queueing; flush barriers follow it.
    pool: AtomicUsize,
    func: WorkFn,
}

impl Work {
    pub fn new<F: Fn(&Arc<Work>) + Send + Sync + 'static>(func: F) -> Arc<Self> {
        Arc::new(Self {
            flags: AtomicUsize::new(0),
            pool: AtomicUsize::new(0),
            func: Box::new(func),
        })
    }

    pub fn is_pending(&self) -> bool {
        test_bit(WORK_PENDING_BIT, &self.flags)
    }

    pub fn is_running(&self) -> bool {
        test_bit(WORK_RUNNING_BIT, &self.flags)
    }
}

// ============================================================================
// Worker pools
// ============================================================================

struct WorkerPool {
    cpu: Option<usize>,
    ring: Ring<usize>,
    idle_gate: AtomicU32,
    nr_idle: AtomicUsize,
    nr_workers: AtomicUsize,
    nr_running: AtomicUsize,
    /// Works whose callback is on a CPU right now; flush spins this to zero
    /// after its barrier so completion (not just dispatch) is covered.
    nr_executing: AtomicUsize,
    min_workers: usize,
    max_workers: usize,
    stopping: AtomicBool,
    threads: SpinLock<Vec<Arc<UThread>>>,
}

impl WorkerPool {
    fn new(cpu: Option<usize>, min_workers: usize, max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            cpu,
            ring: Ring::new(POOL_RING_SIZE, 0).expect("pool ring geometry is static"),
            idle_gate: AtomicU32::new(0),
            nr_idle: AtomicUsize::new(0),
            nr_workers: AtomicUsize::new(0),
            nr_running: AtomicUsize::new(0),
            nr_executing: AtomicUsize::new(0),
            min_workers,
            max_workers,
            stopping: AtomicBool::new(false),
            threads: SpinLock::new(Vec::new()),
        })
    }

    fn wake_one(&self) {
        self.idle_gate.fetch_add(1, Ordering::SeqCst);
        futex_wake(&self.idle_gate, 1);
    }

    fn wake_all(&self) {
        self.idle_gate.fetch_add(1, Ordering::SeqCst);
        futex_wake(&self.idle_gate, 0);
    }

    /// Push one queue-owned work reference, spinning out ring bursts.
    fn push(self: &Arc<Self>, work: Arc<Work>) {
        work.pool
            .store(Arc::as_ptr(self) as usize, Ordering::SeqCst);
        let raw = Arc::into_raw(work) as usize;
        while !self.ring.enqueue(raw) {
            std::thread::yield_now();
        }
        if self.nr_idle.load(Ordering::SeqCst) > 0 {
            self.wake_one();
        } else if self.nr_workers.load(Ordering::SeqCst) < self.max_workers {
            self.spawn_worker();
        }
    }

    fn spawn_worker(self: &Arc<Self>) {
        let pool = self.clone();
        match thread::uthread_run(move |me| {
            worker_main(&pool, me);
            0
        }) {
            Ok(t) => self.threads.lock().push(t),
            Err(err) => log::warn!("worker spawn failed: {}", err),
        }
    }

    fn start(self: &Arc<Self>) {
        for _ in 0..self.min_workers {
            self.spawn_worker();
        }
    }

    fn stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for t in threads {
            let _ = t.stop();
        }
        // Anything queued after the drain belongs to nobody now.
        while let Some(raw) = self.ring.dequeue() {
            let work = unsafe { Arc::from_raw(raw as *const Work) };
            clear_bit(WORK_PENDING_BIT, &work.flags);
        }
    }
}

fn execute_one(pool: &WorkerPool, raw: usize) {
    // Safety: the ring held the queue's reference.
    let work = unsafe { Arc::from_raw(raw as *const Work) };
    pool.nr_executing.fetch_add(1, Ordering::SeqCst);
    set_bit(WORK_RUNNING_BIT, &work.flags);
    test_and_clear_bit(WORK_PENDING_BIT, &work.flags);
    (work.func)(&work);
    clear_bit(WORK_RUNNING_BIT, &work.flags);
    pool.nr_executing.fetch_sub(1, Ordering::SeqCst);
}

fn worker_main(pool: &Arc<WorkerPool>, me: &Arc<UThread>) {
    pool.nr_workers.fetch_add(1, Ordering::SeqCst);
    pool.nr_running.fetch_add(1, Ordering::SeqCst);
    set_current_pool(Arc::as_ptr(pool));
    if let Some(cpu) = pool.cpu {
        UThread::bind_cpu(cpu);
    }

    loop {
        if let Some(raw) = pool.ring.dequeue() {
            execute_one(pool, raw);
            continue;
        }
        if (pool.stopping.load(Ordering::SeqCst) || me.should_stop()) && pool.ring.is_empty() {
            break;
        }

        let gate = pool.idle_gate.load(Ordering::SeqCst);
        pool.nr_idle.fetch_add(1, Ordering::SeqCst);
        let woken = if pool.ring.is_empty() {
            futex_wait(&pool.idle_gate, gate, Some(WORKER_IDLE_TIMEOUT_MS))
        } else {
            true
        };
        pool.nr_idle.fetch_sub(1, Ordering::SeqCst);

        // Idle-timeout teardown above the floor.
        if !woken
            && pool.ring.is_empty()
            && !pool.stopping.load(Ordering::SeqCst)
            && pool.nr_workers.load(Ordering::SeqCst) > pool.min_workers
        {
            break;
        }
    }

    set_current_pool(std::ptr::null());
    pool.nr_running.fetch_sub(1, Ordering::SeqCst);
    pool.nr_workers.fetch_sub(1, Ordering::SeqCst);
}

// ============================================================================
// Futex hooks: keep a pool saturated while its workers block
// ============================================================================

thread_local! {
    static CURRENT_POOL: std::cell::Cell<*const WorkerPool> =
        const { std::cell::Cell::new(std::ptr::null()) };
}

fn set_current_pool(pool: *const WorkerPool) {
    CURRENT_POOL.with(|c| c.set(pool));
}

/// Called by the futex shim as a worker blocks: if it was the last one
/// running and work is waiting, pull an idle sibling in.
pub(crate) fn worker_sleeping() {
    CURRENT_POOL.with(|c| {
        let pool = c.get();
        if pool.is_null() {
            return;
        }
        // Safety: the pool outlives its workers.
        let pool = unsafe { &*pool };
        if pool.nr_running.fetch_sub(1, Ordering::SeqCst) == 1 && !pool.ring.is_empty() {
            pool.wake_one();
        }
    });
}

pub(crate) fn worker_waking_up() {
    CURRENT_POOL.with(|c| {
        let pool = c.get();
        if !pool.is_null() {
            unsafe { &*pool }.nr_running.fetch_add(1, Ordering::SeqCst);
        }
    });
}

// ============================================================================
// Workqueues
// ============================================================================

pub struct Workqueue {
    name: String,
    bound: bool,
    pools: Vec<Arc<WorkerPool>>,
    destroyed: AtomicBool,
}

impl Workqueue {
    /// A queue with one pinned single-worker pool per CPU.
    pub fn new_bound(name: &str) -> Result<Arc<Self>> {
        let pools: Vec<_> = (0..config::nr_cpus())
            .map(|cpu| WorkerPool::new(Some(cpu), 1, 1))
            .collect();
        for pool in &pools {
            pool.start();
        }
        log::debug!("created bound workqueue {} ({} pools)", name, pools.len());
        Ok(Arc::new(Self {
            name: name.to_owned(),
            bound: true,
            pools,
            destroyed: AtomicBool::new(false),
        }))
    }

    /// A queue with one shared pool of floating workers.
    pub fn new_unbound(name: &str) -> Result<Arc<Self>> {
        let cfg = config::config();
        let pool = WorkerPool::new(None, cfg.wq_min_workers, cfg.wq_max_workers);
        pool.start();
        log::debug!("created unbound workqueue {}", name);
        Ok(Arc::new(Self {
            name: name.to_owned(),
            bound: false,
            pools: vec![pool],
            destroyed: AtomicBool::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pool_for_queue(&self) -> &Arc<WorkerPool> {
        if self.bound {
            &self.pools[crate::utils::current_cpu() % self.pools.len()]
        } else {
            &self.pools[0]
        }
    }

    /// Queue `work`; `false` when it was already pending.
    pub fn queue(&self, work: &Arc<Work>) -> bool {
        if test_and_set_bit(WORK_PENDING_BIT, &work.flags) {
            return false;
        }
        self.pool_for_queue().push(work.clone());
        true
    }

    /// Queue `work` on a specific CPU's pool (bound queues).
    pub fn queue_on(&self, cpu: usize, work: &Arc<Work>) -> bool {
        if test_and_set_bit(WORK_PENDING_BIT, &work.flags) {
            return false;
        }
        self.pools[cpu % self.pools.len()].push(work.clone());
        true
    }

    /// Wait until a pending or running `work` has finished executing.
    /// Returns `false` when there was nothing to wait for.
    pub fn flush_work(work: &Arc<Work>) -> bool {
        if work.flags.load(Ordering::SeqCst)
            & (1 << WORK_PENDING_BIT | 1 << WORK_RUNNING_BIT)
            == 0
        {
            return false;
        }
        let pool = work.pool.load(Ordering::SeqCst);
        if pool == 0 {
            return false;
        }
        // Safety: pools live for the workqueue's lifetime and flushing a
        // work on a destroyed queue is a caller bug.
        let pool = unsafe {
            let ptr = pool as *const WorkerPool;
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        };
        barrier_on(&pool);
        // The barrier proves dispatch; a sibling worker may still be inside
        // the callback.
        while work.is_running() {
            std::thread::yield_now();
        }
        true
    }

    /// Flush every pool: one barrier each, executed after everything queued
    /// before it.
    pub fn flush(&self) {
        let barriers: Vec<_> = self
            .pools
            .iter()
            .filter(|p| !p.threads.lock().is_empty())
            .map(|pool| {
                let done = Arc::new(Completion::new());
                let done2 = done.clone();
                let barrier = Work::new(move |_| done2.complete());
                set_bit(WORK_PENDING_BIT, &barrier.flags);
                pool.push(barrier.clone());
                (pool, barrier, done)
            })
            .collect();
        for (pool, _barrier, done) in barriers {
            done.wait();
            while pool.nr_executing.load(Ordering::SeqCst) > 0 {
                std::thread::yield_now();
            }
        }
    }

    /// Drain pending work and tear the pools down. Idempotent; also runs on
    /// drop.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for pool in &self.pools {
            pool.stop();
        }
        log::debug!("destroyed workqueue {}", self.name);
    }
}

impl Drop for Workqueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn barrier_on(pool: &Arc<WorkerPool>) {
    let done = Arc::new(Completion::new());
    let done2 = done.clone();
    let barrier = Work::new(move |_| done2.complete());
    set_bit(WORK_PENDING_BIT, &barrier.flags);
    pool.push(barrier);
    done.wait();
}

// ============================================================================
// Delayed work
// ============================================================================

pub struct DelayedWork {
    work: Arc<Work>,
    timer: Arc<crate::event::UevTimer>,
}

impl DelayedWork {
    pub fn new<F: Fn(&Arc<Work>) + Send + Sync + 'static>(func: F) -> Arc<Self> {
        Arc::new_cyclic(|weak: &std::sync::Weak<DelayedWork>| {
            let work = Work::new(func);
            let timer_weak = weak.clone();
            let timer = crate::event::UevTimer::new(move || {
                if let Some(dwork) = timer_weak.upgrade() {
                    dwork.fire();
                }
            });
            Self { work, timer }
        })
    }

    pub fn work(&self) -> &Arc<Work> {
        &self.work
    }

    fn fire(&self) {
        clear_bit(WORK_DELAYED_BIT, &self.work.flags);
        let target = self.work.pool.load(Ordering::SeqCst);
        debug_assert!(target != 0);
        let pool = unsafe {
            let ptr = target as *const WorkerPool;
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        };
        pool.push(self.work.clone());
    }
}

impl Workqueue {
    /// Run `dwork` after `delay_ms`; `false` when it was already pending.
    pub fn queue_delayed(&self, dwork: &Arc<DelayedWork>, delay_ms: u64) -> bool {
        if test_and_set_bit(WORK_PENDING_BIT, &dwork.work.flags) {
            return false;
        }
        set_bit(WORK_DELAYED_BIT, &dwork.work.flags);
        // Remember the target pool now; the timer callback only enqueues.
        dwork
            .work
            .pool
            .store(Arc::as_ptr(self.pool_for_queue()) as usize, Ordering::SeqCst);
        if let Err(err) = dwork.timer.add(delay_ms) {
            clear_bit(WORK_DELAYED_BIT, &dwork.work.flags);
            clear_bit(WORK_PENDING_BIT, &dwork.work.flags);
            log::warn!("delayed work timer failed: {}", err);
            return false;
        }
        true
    }
}

// ============================================================================
// The system workqueue
// ============================================================================

static SYSTEM_WQ: Lazy<Arc<Workqueue>> =
    Lazy::new(|| Workqueue::new_unbound("system").expect("system workqueue"));

pub fn system_wq() -> &'static Arc<Workqueue> {
    &SYSTEM_WQ
}

/// Queue onto the system workqueue.
pub fn schedule_work(work: &Arc<Work>) -> bool {
    system_wq().queue(work)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn queue_runs_work_once() {
        let wq = Workqueue::new_unbound("t-once").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let work = Work::new(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(wq.queue(&work));
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        wq.destroy();
    }

    #[test]
    fn double_queue_collapses() {
        let wq = Workqueue::new_unbound("t-dup").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let work = Work::new(move |_| {
            h2.fetch_add(1, Ordering::SeqCst);
        });
        // Claim PENDING the way an in-flight queue would have.
        assert!(!test_and_set_bit(WORK_PENDING_BIT, &work.flags));
        assert!(!wq.queue(&work));
        clear_bit(WORK_PENDING_BIT, &work.flags);
        assert!(wq.queue(&work));
        wq.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        wq.destroy();
    }

    #[test]
    fn requeue_from_callback() {
        let wq = Workqueue::new_unbound("t-requeue").unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Completion::new());
        let wq2 = wq.clone();
        let (c2, d2) = (count.clone(), done.clone());
        let work = Work::new(move |me| {
            if c2.fetch_add(1, Ordering::SeqCst) + 1 < 50 {
                assert!(wq2.queue(me));
            } else {
                d2.complete();
            }
        });
        assert!(wq.queue(&work));
        assert!(done.wait_timeout(Some(5_000)));
        assert_eq!(count.load(Ordering::SeqCst), 50);
        wq.destroy();
    }

    #[test]
    fn flush_work_waits_for_running() {
        let wq = Workqueue::new_unbound("t-flush").unwrap();
        let gate = Arc::new(Completion::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let (g2, h2) = (gate.clone(), hits.clone());
        let work = Work::new(move |_| {
            g2.wait();
            h2.fetch_add(1, Ordering::SeqCst);
        });
        wq.queue(&work);
        std::thread::sleep(Duration::from_millis(30));
        gate.complete();
        assert!(Workqueue::flush_work(&work));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        wq.destroy();
    }

    #[test]
    fn bound_pool_preserves_order() {
        let wq = Workqueue::new_bound("t-order").unwrap();
        let seq = Arc::new(SpinLock::new(Vec::new()));
        let works: Vec<_> = (0..16)
            .map(|i| {
                let seq = seq.clone();
                Work::new(move |_| {
                    seq.lock().push(i);
                })
            })
            .collect();
        for w in &works {
            assert!(wq.queue_on(1, w));
        }
        wq.flush();
        let seq = seq.lock();
        assert_eq!(*seq, (0..16).collect::<Vec<_>>());
        wq.destroy();
    }
}

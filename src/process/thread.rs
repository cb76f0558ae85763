// Threads.
//
// Runtime threads are created paused on a stack drawn from a LIFO pool of
// guard-paged mmap regions. A pooled stack remembers its previous owner and
// is only handed out again once a liveness probe says that thread is gone.
// The creation handshake runs on completions: the helper publishes itself,
// completes `created`, then parks on `started` until `wakeup` (or a stop)
// releases it.

use once_cell::sync::Lazy;
use std::cell::{RefCell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config;
use crate::error::{Result, RtError};
use crate::process::completion::Completion;
use crate::utils::bitops::{cond_load_acquire, test_and_clear_bit, test_and_set_bit, test_bit};
use crate::utils::mutex::Mutex;
use crate::utils::{get_thread_id, set_current_cpu};

pub const THREAD_MAIN_BIT: usize = 0;
pub const THREAD_RUNNING_BIT: usize = 1;
pub const THREAD_STOPPING_BIT: usize = 2;
pub const THREAD_STOPPED_BIT: usize = 3;
pub const THREAD_WAKING_BIT: usize = 4;
pub const THREAD_DETACHED_BIT: usize = 5;
pub const THREAD_EVENTWORKER_BIT: usize = 6;

pub type ThreadFn = Box<dyn FnOnce(&Arc<UThread>) -> i32 + Send>;

pub struct UThread {
    flags: AtomicUsize,
    tid: AtomicI32,
    pthid: AtomicUsize,
    cpu: usize,
    /// Whole mapping including the guard page; null for the main thread.
    stack: *mut u8,
    created: Completion,
    started: Completion,
    stopped: Completion,
    ret: AtomicI32,
    entry: UnsafeCell<Option<ThreadFn>>,
}

// Safety: `entry` is taken exactly once by the helper; `stack` ownership
// moves with the lifecycle protocol (join or detach hand-off).
unsafe impl Send for UThread {}
unsafe impl Sync for UThread {}

static MAIN_THREAD: Lazy<Arc<UThread>> = Lazy::new(|| {
    let t = Arc::new(UThread::bare(0));
    t.flags.store(1 << THREAD_MAIN_BIT, Ordering::SeqCst);
    t.tid.store(get_thread_id(), Ordering::SeqCst);
    t
});

thread_local! {
    static CURRENT: RefCell<Option<Arc<UThread>>> = const { RefCell::new(None) };
}

/// The calling thread's control block; foreign threads resolve to the main
/// thread's block.
pub fn current() -> Arc<UThread> {
    CURRENT.with(|cell| {
        if let Some(t) = cell.borrow().as_ref() {
            return t.clone();
        }
        let main = MAIN_THREAD.clone();
        *cell.borrow_mut() = Some(main.clone());
        main
    })
}

fn current_is(thread: &Arc<UThread>) -> bool {
    CURRENT.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|t| Arc::ptr_eq(t, thread))
            .unwrap_or(false)
    })
}

// ============================================================================
// Stack pool
// ============================================================================

struct StackEntry {
    tid: i32,
    pthid: libc::pthread_t,
    stack: *mut u8,
}

unsafe impl Send for StackEntry {}

static STACK_POOL: Mutex<Vec<StackEntry>> = Mutex::new(Vec::new());

fn reserve_nr_stacks() -> usize {
    config::nr_cpus()
}

fn stack_total_size() -> usize {
    config::config().stack_size + config::page_size()
}

fn stack_alive(entry: &StackEntry) -> bool {
    if entry.tid <= 0 {
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), entry.tid, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
    }
    #[cfg(not(target_os = "linux"))]
    {
        unsafe { libc::pthread_kill(entry.pthid, 0) == 0 }
    }
}

fn stack_pop() -> Option<*mut u8> {
    let mut pool = STACK_POOL.lock();
    if let Some(i) = pool.iter().position(|e| !stack_alive(e)) {
        let entry = pool.swap_remove(i);
        return Some(entry.stack);
    }
    drop(pool);

    let total = stack_total_size();
    let stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        log::warn!("thread stack mmap failed: {}", std::io::Error::last_os_error());
        return None;
    }
    // Guard page at the bottom.
    if unsafe { libc::mprotect(stack, config::page_size(), libc::PROT_NONE) } != 0 {
        log::warn!("stack guard mprotect failed: {}", std::io::Error::last_os_error());
        unsafe { libc::munmap(stack, total) };
        return None;
    }
    log::debug!("created thread stack at {:p}", stack);
    Some(stack as *mut u8)
}

fn stack_push(stack: *mut u8, tid: i32, pthid: libc::pthread_t) {
    let mut pool = STACK_POOL.lock();
    // Trim dead spares beyond the reserve.
    while pool.len() > reserve_nr_stacks() {
        let Some(i) = pool.iter().position(|e| !stack_alive(e)) else {
            break;
        };
        let entry = pool.swap_remove(i);
        unsafe { libc::munmap(entry.stack as *mut _, stack_total_size()) };
        log::info!("released thread stack at {:p}", entry.stack);
    }
    pool.push(StackEntry { tid, pthid, stack });
}

// ============================================================================
// Lifecycle
// ============================================================================

impl UThread {
    fn bare(cpu: usize) -> Self {
        Self {
            flags: AtomicUsize::new(0),
            tid: AtomicI32::new(-1),
            pthid: AtomicUsize::new(0),
            cpu,
            stack: ptr::null_mut(),
            created: Completion::new(),
            started: Completion::new(),
            stopped: Completion::new(),
            ret: AtomicI32::new(0),
            entry: UnsafeCell::new(None),
        }
    }

    pub fn flags(&self) -> usize {
        self.flags.load(Ordering::SeqCst)
    }

    pub fn tid(&self) -> i32 {
        self.tid.load(Ordering::SeqCst)
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }

    pub(crate) fn pthread_handle(&self) -> libc::pthread_t {
        self.pthid.load(Ordering::SeqCst) as libc::pthread_t
    }

    pub fn is_main(&self) -> bool {
        test_bit(THREAD_MAIN_BIT, &self.flags)
    }

    pub fn is_running(&self) -> bool {
        test_bit(THREAD_RUNNING_BIT, &self.flags)
    }

    pub fn is_event_worker(&self) -> bool {
        test_bit(THREAD_EVENTWORKER_BIT, &self.flags)
    }

    /// True once a stop has been requested; thread functions poll this.
    pub fn should_stop(&self) -> bool {
        test_bit(THREAD_STOPPING_BIT, &self.flags)
    }

    /// Release a paused thread into its function and wait until it is
    /// observably RUNNING (or already STOPPING).
    pub fn wakeup(&self) -> Result<()> {
        if test_and_set_bit(THREAD_WAKING_BIT, &self.flags) {
            return Err(RtError::WouldBlock);
        }
        let rc = if self.is_running() {
            Err(RtError::WouldBlock)
        } else {
            self.started.complete();
            // Without this, a stop right after wakeup() could beat the
            // thread out of its own startup.
            cond_load_acquire(&self.flags, |f| {
                f & (1 << THREAD_RUNNING_BIT | 1 << THREAD_STOPPING_BIT) != 0
            });
            Ok(())
        };
        test_and_clear_bit(THREAD_WAKING_BIT, &self.flags);
        rc
    }

    /// Cooperative stop: request it, release the startup gate if the
    /// thread never ran, join, recycle the stack. Returns the exit code.
    pub fn stop(self: &Arc<Self>) -> Result<i32> {
        assert!(!current_is(self), "a thread cannot stop itself");
        if self.is_main() || test_bit(THREAD_DETACHED_BIT, &self.flags) {
            return Err(RtError::InvalidArgument("cannot stop this thread".into()));
        }
        if test_and_set_bit(THREAD_STOPPING_BIT, &self.flags) {
            return Err(RtError::AlreadyStopped);
        }
        if !self.is_running() {
            self.started.complete();
        }
        Ok(self.join())
    }

    /// Forceful stop. The only fast path is a thread that never entered
    /// RUNNING, which exits straight out of its startup gate; anything else
    /// degrades to `stop`. Returns 1 when the thread function never ran.
    pub fn kill(self: &Arc<Self>) -> Result<i32> {
        let never_ran = !self.is_running();
        self.stop()?;
        Ok(if never_ran && !self.is_running() { 1 } else { 0 })
    }

    fn join(self: &Arc<Self>) -> i32 {
        self.stopped.wait();
        debug_assert!(test_bit(THREAD_STOPPED_BIT, &self.flags));
        unsafe { libc::pthread_join(self.pthid.load(Ordering::SeqCst) as libc::pthread_t, ptr::null_mut()) };
        if !self.stack.is_null() {
            stack_push(self.stack, self.tid(), self.pthid.load(Ordering::SeqCst) as libc::pthread_t);
        }
        log::debug!("joined thread {}", self.tid());
        self.ret.load(Ordering::SeqCst)
    }

    /// Detach the calling thread; its resources are released on exit and it
    /// can no longer be stopped or joined.
    pub fn detach(self: &Arc<Self>) {
        assert!(current_is(self), "detach only applies to the calling thread");
        assert!(!self.is_event_worker(), "event workers cannot detach");
        if self.is_main() || test_and_set_bit(THREAD_DETACHED_BIT, &self.flags) {
            return;
        }
        unsafe { libc::pthread_detach(self.pthid.load(Ordering::SeqCst) as libc::pthread_t) };
    }

    /// Pin the calling thread to a CPU where the platform supports it.
    pub fn bind_cpu(cpu: usize) {
        #[cfg(target_os = "linux")]
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu % num_cpus::get().max(1), &mut set);
            libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = cpu;
        }
    }
}

extern "C" fn thread_helper(arg: *mut libc::c_void) -> *mut libc::c_void {
    // Safety: the creator leaked exactly one Arc reference for us.
    let thread = unsafe { Arc::from_raw(arg as *const UThread) };

    thread.tid.store(get_thread_id(), Ordering::SeqCst);
    set_current_cpu(thread.cpu);
    CURRENT.with(|cell| *cell.borrow_mut() = Some(thread.clone()));

    thread.created.complete();
    thread.started.wait();

    if !thread.should_stop() {
        assert!(!test_and_set_bit(THREAD_RUNNING_BIT, &thread.flags));
        let func = unsafe { (*thread.entry.get()).take() }.expect("thread entry already taken");
        let ret = func(&thread);
        thread.ret.store(ret, Ordering::SeqCst);
    }

    test_and_set_bit(THREAD_STOPPED_BIT, &thread.flags);
    thread.stopped.complete();
    CURRENT.with(|cell| *cell.borrow_mut() = None);

    if test_bit(THREAD_DETACHED_BIT, &thread.flags) && !thread.stack.is_null() {
        // Nobody will join us; hand the stack back ourselves. The pool's
        // liveness probe keeps it parked until this thread is truly gone.
        stack_push(
            thread.stack,
            thread.tid(),
            thread.pthid.load(Ordering::SeqCst) as libc::pthread_t,
        );
    }
    ptr::null_mut()
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

pub(crate) fn spawn(
    cpu: Option<usize>,
    event_worker: bool,
    func: ThreadFn,
) -> Result<Arc<UThread>> {
    let cpu = cpu.unwrap_or_else(|| NEXT_CPU.fetch_add(1, Ordering::Relaxed) % config::nr_cpus());
    let mut thread = UThread::bare(cpu);
    if event_worker {
        thread.flags = AtomicUsize::new(1 << THREAD_EVENTWORKER_BIT);
    }
    thread.stack = stack_pop().ok_or(RtError::OutOfMemory("no thread stack"))?;
    thread.entry = UnsafeCell::new(Some(func));
    let thread = Arc::new(thread);

    let mut attr: libc::pthread_attr_t = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::pthread_attr_init(&mut attr) };
    if rc != 0 {
        stack_push(thread.stack, -1, 0 as libc::pthread_t);
        return Err(RtError::Io(std::io::Error::from_raw_os_error(rc)));
    }

    let usable = unsafe { thread.stack.add(config::page_size()) };
    let mut pthid: libc::pthread_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::pthread_attr_setstack(
            &mut attr,
            usable as *mut libc::c_void,
            config::config().stack_size,
        )
    };
    let rc = if rc == 0 {
        let raw = Arc::into_raw(thread.clone());
        let rc = unsafe {
            libc::pthread_create(&mut pthid, &attr, thread_helper, raw as *mut libc::c_void)
        };
        if rc != 0 {
            // The helper never ran; reclaim its reference.
            unsafe { drop(Arc::from_raw(raw)) };
        }
        rc
    } else {
        rc
    };
    unsafe { libc::pthread_attr_destroy(&mut attr) };

    if rc != 0 {
        stack_push(thread.stack, -1, 0 as libc::pthread_t);
        return Err(RtError::Io(std::io::Error::from_raw_os_error(rc)));
    }

    thread.pthid.store(pthid as usize, Ordering::SeqCst);
    thread.created.wait();
    log::debug!("created thread {} on cpu slot {}", thread.tid(), cpu);
    Ok(thread)
}

/// Create a thread, paused until `wakeup` (or stopped before ever running).
pub fn uthread_create<F>(func: F) -> Result<Arc<UThread>>
where
    F: FnOnce(&Arc<UThread>) -> i32 + Send + 'static,
{
    spawn(None, false, Box::new(func))
}

/// Create and immediately wake a thread.
pub fn uthread_run<F>(func: F) -> Result<Arc<UThread>>
where
    F: FnOnce(&Arc<UThread>) -> i32 + Send + 'static,
{
    let thread = uthread_create(func)?;
    thread.wakeup()?;
    Ok(thread)
}

// ============================================================================
// TLS cleanup
// ============================================================================

struct TlsCleaners(Vec<Box<dyn FnOnce()>>);

impl Drop for TlsCleaners {
    fn drop(&mut self) {
        // LIFO, like the registration list it models.
        while let Some(action) = self.0.pop() {
            action();
        }
    }
}

thread_local! {
    static TLS_CLEANERS: RefCell<TlsCleaners> = RefCell::new(TlsCleaners(Vec::new()));
}

/// Run `action` when the calling thread exits (LIFO across registrations).
/// On the main thread this piggybacks on thread-local destruction at
/// process exit.
pub fn tlsclnr_register<F: FnOnce() + 'static>(action: F) {
    TLS_CLEANERS.with(|c| c.borrow_mut().0.push(Box::new(action)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn created_thread_stays_paused_until_wakeup() {
        let ran = Arc::new(AtomicBool::new(false));
        let r2 = ran.clone();
        let t = uthread_create(move |_| {
            r2.store(true, Ordering::SeqCst);
            7
        })
        .unwrap();

        std::thread::sleep(std::time::Duration::from_millis(30));
        assert!(!ran.load(Ordering::SeqCst));

        t.wakeup().unwrap();
        assert_eq!(t.stop().unwrap(), 7);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn stop_without_wakeup_skips_the_function() {
        let ran = Arc::new(AtomicBool::new(false));
        let r2 = ran.clone();
        let t = uthread_create(move |_| {
            r2.store(true, Ordering::SeqCst);
            0
        })
        .unwrap();
        assert_eq!(t.kill().unwrap(), 1);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn should_stop_is_observed() {
        let t = uthread_run(|me| {
            while !me.should_stop() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            42
        })
        .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(t.stop().unwrap(), 42);
    }

    #[test]
    fn stacks_get_recycled() {
        // Run enough short-lived threads that the pool must hand stacks
        // back out; correctness is them all completing.
        for round in 0..3 {
            let threads: Vec<_> = (0..4)
                .map(|i| uthread_run(move |_| (round * 10 + i) as i32).unwrap())
                .collect();
            for (i, t) in threads.into_iter().enumerate() {
                assert_eq!(t.stop().unwrap(), (round * 10 + i) as i32);
            }
        }
    }

    #[test]
    fn tls_cleaners_run_on_exit() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let t = uthread_run(|_| {
            tlsclnr_register(|| {
                RUNS.fetch_add(1, Ordering::SeqCst);
            });
            tlsclnr_register(|| {
                RUNS.fetch_add(1, Ordering::SeqCst);
            });
            0
        })
        .unwrap();
        t.stop().unwrap();
        // Helper threads run TLS destructors before pthread_join returns.
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
    }
}

// Foundation utilities: atomics and hashing, the futex shim, spinning and
// sleeping locks, and the saturating reference counter.

pub mod bitops;
pub mod futex;
pub mod mutex;
pub mod rwsem;
pub mod spinlock;
pub mod uref;

pub use bitops::{hash_long, hash_ptr};
pub use futex::{futex_cond_wait, futex_wait, futex_wake};
pub use mutex::{Mutex, MutexGuard, RawMutex, RecursiveMutex};
pub use rwsem::RwSem;
pub use spinlock::{RawSpinLock, SpinGuard, SpinLock};
pub use uref::Uref;

thread_local! {
    static CPU_SLOT: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

static CPU_SLOT_NEXT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

/// The CPU slot of the calling thread. Runtime threads are assigned a slot
/// at creation; foreign threads get one round-robin on first use. Per-CPU
/// state (slab magazines, bound workqueue pools) is sharded by this.
pub fn current_cpu() -> usize {
    CPU_SLOT.with(|slot| {
        let mut cpu = slot.get();
        if cpu == usize::MAX {
            cpu = CPU_SLOT_NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
                % crate::config::nr_cpus();
            slot.set(cpu);
        }
        cpu
    })
}

pub(crate) fn set_current_cpu(cpu: usize) {
    CPU_SLOT.with(|slot| slot.set(cpu % crate::config::nr_cpus()));
}

/// OS-level id of the calling thread. Stable for the thread's lifetime and
/// usable from signal-free probe paths.
pub fn get_thread_id() -> i32 {
    #[cfg(target_os = "linux")]
    {
        (unsafe { libc::syscall(libc::SYS_gettid) }) as i32
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Collapse the pthread handle; uniqueness is all callers rely on.
        let id = unsafe { libc::pthread_self() } as usize;
        (crate::utils::hash_long(id as u64, 31) as i32).max(1)
    }
}

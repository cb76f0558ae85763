// ukern - a user-space kernel runtime.
//
// The crate provides the primitives asynchronous network servers are built
// on: a NUMA-aware buddy page allocator with a slab cache on top, a
// futex-based synchronization stack (spinlocks, mutexes, rwsems, wait
// queues, completions, bit-waits), pooled threads with TLS cleanup,
// workqueues, per-CPU event loops (readiness, timers, signals, async
// wake-ups, RCU), and a reference-counted transport/server framework.

pub mod config;
pub mod error;
pub mod event;
pub mod mm;
pub mod net;
pub mod process;
pub mod ring;
pub mod utils;

pub use config::{config, RuntimeConfig};
pub use error::{Result, RtError};

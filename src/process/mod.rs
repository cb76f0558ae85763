// Execution substrate: wait primitives, completions, threads and
// workqueues.

pub mod completion;
pub mod thread;
pub mod wait;
pub mod workqueue;

pub use completion::Completion;
pub use thread::{current, tlsclnr_register, uthread_create, uthread_run, UThread};
pub use wait::{wait_on_bit, wait_on_bit_lock, wake_up_bit, WaitQueueEntry, WaitQueueHead};
pub use workqueue::{schedule_work, system_wq, DelayedWork, Work, Workqueue};

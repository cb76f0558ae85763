// Coarse RCU grace periods.
//
// Every loop iteration bumps that loop's epoch. A callback is stamped with
// a deadline (enqueue time plus the configured interval) and a snapshot of
// every loop's epoch; it fires on its owning loop once the deadline has
// elapsed *and* every loop has ticked past its snapshot, so any read-side
// critical section that was running inside a loop when the callback was
// enqueued has drained. Firing late is fine; firing early never happens.

use std::sync::Arc;

use crate::config;
use crate::event::{current_loop_id, loops, now_ms, EventLoop};
use crate::process::completion::Completion;
use crate::process::thread;

pub(crate) struct RcuCall {
    cb: Option<Box<dyn FnOnce() + Send>>,
    deadline: u64,
    /// Epoch snapshot indexed by loop id.
    epochs: Vec<u64>,
}

/// Run `cb` after the current grace period: no earlier than the RCU
/// interval from now, and only once every event loop has ticked.
pub fn call_rcu<F: FnOnce() + Send + 'static>(cb: F) {
    let all = loops();
    let target = match current_loop_id() {
        Some(id) => &all[id],
        None => {
            // Spread foreign-thread submissions by CPU slot.
            &all[crate::utils::current_cpu() % all.len()]
        }
    };

    let call = RcuCall {
        cb: Some(Box::new(cb)),
        deadline: now_ms() + config::config().rcu_interval_ms,
        epochs: all.iter().map(|l| l.epoch()).collect(),
    };
    target.rcu_q.lock().push_back(call);
    target.wake();
}

/// Block until a full grace period has elapsed. Must not be called from an
/// event loop thread.
pub fn synchronize_rcu() {
    assert!(
        !thread::current().is_event_worker(),
        "synchronize_rcu would deadlock an event loop"
    );
    let done = Arc::new(Completion::new());
    let d2 = done.clone();
    call_rcu(move || d2.complete());
    done.wait();
}

/// Fire the loop's due callbacks; called from its iteration tail.
pub(crate) fn run_ready(lop: &Arc<EventLoop>) {
    let now = now_ms();
    let all = loops();

    let mut ready = Vec::new();
    {
        let mut queue = lop.rcu_q.lock();
        while let Some(front) = queue.front() {
            if front.deadline > now {
                break;
            }
            let covered = front
                .epochs
                .iter()
                .enumerate()
                .all(|(id, &snap)| all[id].epoch() > snap);
            if !covered {
                break;
            }
            ready.push(queue.pop_front().expect("peeked call vanished"));
        }
    }

    for mut call in ready {
        if let Some(cb) = call.cb.take() {
            cb();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    #[test]
    fn callback_respects_the_interval() {
        let fired = Arc::new(AtomicU64::new(0));
        let f2 = fired.clone();
        let enqueued = now_ms();
        call_rcu(move || {
            f2.store(now_ms().max(1), Ordering::SeqCst);
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(std::time::Instant::now() < deadline, "rcu callback never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
        let at = fired.load(Ordering::SeqCst);
        assert!(at >= enqueued + config::config().rcu_interval_ms);
    }

    #[test]
    fn synchronize_rcu_returns() {
        let start = now_ms();
        synchronize_rcu();
        assert!(now_ms() >= start + config::config().rcu_interval_ms);
    }
}

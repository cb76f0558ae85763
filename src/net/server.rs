// Servers.
//
// A server owns the list of live xprts (one reference each), a user count
// covering itself plus every attached xprt, and a waitqueue that both the
// serve loop and the teardown path block on. States move strictly
// INITING -> RUNNING -> STOPPING -> STOPPED -> DESTROYED.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{Result, RtError};
use crate::net::xprt::Xprt;
use crate::process::wait::{WaitQueueEntry, WaitQueueHead};
use crate::utils::spinlock::SpinLock;
use crate::utils::uref::Uref;

pub const SERVER_INITING: u32 = 1;
pub const SERVER_RUNNING: u32 = 2;
pub const SERVER_STOPPING: u32 = 3;
pub const SERVER_STOPPED: u32 = 4;
pub const SERVER_DESTROYED: u32 = 5;

pub type ServerDtor = Box<dyn FnOnce(&Server) + Send>;

pub struct Server {
    max_xprts: u32,
    state: AtomicU32,
    users: Uref,
    xprts: SpinLock<Vec<Arc<Xprt>>>,
    nr_xprts: AtomicU32,
    waitq: WaitQueueHead,
    destructor: SpinLock<Option<ServerDtor>>,
}

/// Allocate a server able to carry up to `max_xprts` transports.
pub fn create_server(max_xprts: u32, destructor: Option<ServerDtor>) -> Result<Arc<Server>> {
    if max_xprts == 0 {
        return Err(RtError::InvalidArgument("a server needs room for xprts".into()));
    }
    if max_xprts < 2 {
        log::warn!("server with room for a single xprt cannot also accept");
    }
    Ok(Arc::new(Server {
        max_xprts,
        state: AtomicU32::new(SERVER_INITING),
        users: Uref::new(),
        xprts: SpinLock::new(Vec::new()),
        nr_xprts: AtomicU32::new(0),
        waitq: WaitQueueHead::new(),
        destructor: SpinLock::new(destructor),
    }))
}

impl Server {
    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn nr_xprts(&self) -> u32 {
        self.nr_xprts.load(Ordering::SeqCst)
    }

    pub fn max_xprts(&self) -> u32 {
        self.max_xprts
    }

    fn has_stopped(&self) -> bool {
        self.state() >= SERVER_STOPPING
    }

    /// Link an xprt, taking the server-side reference.
    pub(crate) fn attach(&self, xprt: &Arc<Xprt>) -> Result<()> {
        let mut list = self.xprts.lock();
        if self.has_stopped() {
            return Err(RtError::WrongState("server is shutting down"));
        }
        if self.nr_xprts.load(Ordering::SeqCst) >= self.max_xprts {
            return Err(RtError::InvalidArgument("xprt limit reached".into()));
        }
        list.push(xprt.clone());
        self.nr_xprts.fetch_add(1, Ordering::SeqCst);
        self.users.get();
        Ok(())
    }

    /// Unlink an xprt, dropping the server-side reference and prodding
    /// anyone waiting for the population to drain.
    pub(crate) fn detach(&self, xprt: &Arc<Xprt>) {
        let mut list = self.xprts.lock();
        let before = list.len();
        list.retain(|x| !Arc::ptr_eq(x, xprt));
        if list.len() == before {
            return;
        }
        self.nr_xprts.fetch_sub(1, Ordering::SeqCst);
        drop(list);
        // The self reference keeps the count above zero until destroy.
        let released = self.users.put();
        debug_assert!(!released);
        self.waitq.wake_up_all();
    }

    /// Serve until stopped: marks RUNNING, parks on the waitqueue until a
    /// stop request arrives, then acknowledges with STOPPED.
    pub fn serve(&self) {
        if self
            .state
            .compare_exchange(
                SERVER_INITING,
                SERVER_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            if self.has_stopped() {
                let _ = self.state.compare_exchange(
                    SERVER_STOPPING,
                    SERVER_STOPPED,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                return;
            }
            log::warn!("server loop entered twice");
            return;
        }

        let entry = WaitQueueEntry::new();
        loop {
            self.waitq.prepare_to_wait(&entry);
            if self.has_stopped() {
                break;
            }
            entry.wait_on();
        }
        self.waitq.finish_wait(&entry);

        let _ = self.state.compare_exchange(
            SERVER_STOPPING,
            SERVER_STOPPED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        log::debug!("server loop drained");
    }

    /// Ask a running server to stop; the serve loop acknowledges.
    pub fn stop(&self) {
        let _ = self.state.compare_exchange(
            SERVER_INITING,
            SERVER_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            SERVER_RUNNING,
            SERVER_STOPPING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.waitq.wake_up_all();
    }

    fn wait_users(&self, timeout_ms: u64) -> bool {
        let entry = WaitQueueEntry::new();
        self.waitq.prepare_to_wait(&entry);
        if self.users.read() > 1 {
            entry.wait_on_timeout(Some(timeout_ms));
        }
        self.waitq.finish_wait(&entry);
        self.users.read() <= 1
    }

    /// Tear the server down: force the stopped state, destroy every linked
    /// xprt, wait for the user count to drain, then run the destructor
    /// exactly once.
    pub fn destroy(self: &Arc<Self>) {
        let prev = self.state.swap(SERVER_DESTROYED, Ordering::SeqCst);
        if prev == SERVER_DESTROYED {
            log::warn!("server destroyed twice");
            return;
        }
        if prev == SERVER_RUNNING {
            // Give a live serve loop its wake-up first.
            self.waitq.wake_up_all();
            std::thread::yield_now();
        }

        loop {
            let snapshot: Vec<Arc<Xprt>> = self.xprts.lock().clone();
            for xprt in snapshot {
                xprt.destroy();
            }
            if self.wait_users(1_000) {
                break;
            }
            log::debug!("server still has users, retrying teardown");
        }

        assert!(self.xprts.lock().is_empty());
        assert_eq!(self.users.read(), 1);
        log::debug!("all xprts destroyed");

        if let Some(dtor) = self.destructor.lock().take() {
            dtor(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn create_validates_capacity() {
        assert!(create_server(0, None).is_err());
        let server = create_server(8, None).unwrap();
        assert_eq!(server.state(), SERVER_INITING);
        assert_eq!(server.nr_xprts(), 0);
    }

    #[test]
    fn destroy_runs_destructor_once() {
        static RUNS: AtomicUsize = AtomicUsize::new(0);
        let server = create_server(
            4,
            Some(Box::new(|_s| {
                RUNS.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        server.destroy();
        server.destroy();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(server.state(), SERVER_DESTROYED);
    }

    #[test]
    fn serve_acknowledges_stop() {
        let server = create_server(4, None).unwrap();
        let s2 = server.clone();
        let t = std::thread::spawn(move || s2.serve());
        while server.state() != SERVER_RUNNING {
            std::thread::yield_now();
        }
        server.stop();
        t.join().unwrap();
        assert_eq!(server.state(), SERVER_STOPPED);
        server.destroy();
    }
}

// Event loops.
//
// A fixed set of loops comes up on first use, each owned by a dedicated
// EVENTWORKER thread: readiness poller + timer heap + signal fd + async
// wake + RCU queue. Loop-local state is touched only by the owning thread;
// every cross-thread request travels the loop's control ring followed by a
// wake. Synchronous deletion round-trips a completion through the loop, so
// its return proves the callback is not running and never will again.
// Callbacks run one at a time on the loop thread and must not block on
// primitives their own loop services.

pub mod poller;
pub mod rcu;

use once_cell::sync::{Lazy, OnceCell};
use std::cell::UnsafeCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::config;
use crate::error::{Result, RtError};
use crate::process::completion::Completion;
use crate::process::thread::{self, UThread};
use crate::ring::Ring;
use crate::utils::bitops::{clear_bit, test_and_set_bit, test_bit};
use crate::utils::spinlock::SpinLock;

use poller::{PollEvent, Poller, POLL_EDGE, POLL_IN, POLL_OUT};

pub const EVENT_READ: u32 = POLL_IN;
pub const EVENT_WRITE: u32 = POLL_OUT;
pub const EVENT_EDGE: u32 = POLL_EDGE;
pub use poller::{POLL_ERR, POLL_HUP};

const EV_ATTACHED_BIT: usize = 0;
const EV_DEAD_BIT: usize = 1;

const CTL_RING_SIZE: u32 = 1 << 10;

/// Monotonic milliseconds since the runtime came up.
pub(crate) fn now_ms() -> u64 {
    static START: Lazy<Instant> = Lazy::new(Instant::now);
    START.elapsed().as_millis() as u64
}

// ============================================================================
// Event objects
// ============================================================================

pub type StreamFn = Box<dyn Fn(&Arc<UevStream>, u32) + Send + Sync>;

/// Readiness event for one file descriptor.
pub struct UevStream {
    fd: i32,
    mask: AtomicU32,
    state: AtomicUsize,
    lop: AtomicUsize,
    cb: StreamFn,
}

pub struct UevTimer {
    state: AtomicUsize,
    gen: AtomicU64,
    lop: AtomicUsize,
    cb: Box<dyn Fn() + Send + Sync>,
}

pub struct UevAsync {
    pending: AtomicU32,
    state: AtomicUsize,
    lop: AtomicUsize,
    cb: Box<dyn Fn() + Send + Sync>,
}

pub struct UevSignal {
    signo: i32,
    lop: AtomicUsize,
    cb: Box<dyn Fn(i32) + Send + Sync>,
}

enum CtlMsg {
    StreamAdd(Arc<UevStream>),
    StreamMod(Arc<UevStream>),
    StreamDel(Arc<UevStream>, Option<Arc<Completion>>),
    TimerAdd(Arc<UevTimer>, u64, u64),
    TimerAck(Option<Arc<Completion>>),
    AsyncAdd(Arc<UevAsync>),
    AsyncDel(Arc<UevAsync>, Option<Arc<Completion>>),
    SignalAdd(Arc<UevSignal>),
    SignalDel(Arc<UevSignal>, Option<Arc<Completion>>),
}

struct TimerEntry {
    deadline: u64,
    seq: u64,
    gen: u64,
    timer: Arc<UevTimer>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

// ============================================================================
// The loop proper
// ============================================================================

struct LoopInner {
    poller: Poller,
    streams: HashMap<i32, Arc<UevStream>>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    asyncs: Vec<Arc<UevAsync>>,
    signals: HashMap<i32, Arc<UevSignal>>,
    timer_seq: u64,
    #[cfg(target_os = "linux")]
    sigfd: i32,
    #[cfg(target_os = "linux")]
    sigmask: libc::sigset_t,
    #[cfg(not(target_os = "linux"))]
    sigpipe_rfd: i32,
}

pub struct EventLoop {
    id: usize,
    wake_rfd: i32,
    wake_wfd: i32,
    wake_pending: AtomicU32,
    ctl: Ring<usize>,
    epoch: AtomicU64,
    pub(crate) rcu_q: SpinLock<VecDeque<rcu::RcuCall>>,
    inner: UnsafeCell<LoopInner>,
    thread: OnceCell<Arc<UThread>>,
    #[cfg(not(target_os = "linux"))]
    sigpipe_wfd: AtomicUsize,
}

// Safety: `inner` is only touched by the owning loop thread; everything
// else is atomics, rings or locks.
unsafe impl Send for EventLoop {}
unsafe impl Sync for EventLoop {}

static LOOPS: Lazy<Vec<Arc<EventLoop>>> = Lazy::new(|| {
    (0..config::config().event_loops)
        .map(EventLoop::start)
        .collect()
});
static NEXT_LOOP: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_LOOP: std::cell::Cell<usize> = const { std::cell::Cell::new(usize::MAX) };
}

pub(crate) fn loops() -> &'static [Arc<EventLoop>] {
    &LOOPS
}

pub fn nr_loops() -> usize {
    loops().len()
}

pub(crate) fn current_loop_id() -> Option<usize> {
    CURRENT_LOOP.with(|c| {
        let id = c.get();
        (id != usize::MAX).then_some(id)
    })
}

/// Pick a loop for a fresh registration, round-robin.
fn assign_loop() -> &'static Arc<EventLoop> {
    let loops = loops();
    &loops[NEXT_LOOP.fetch_add(1, Ordering::Relaxed) % loops.len()]
}

fn loop_by_slot(slot: &AtomicUsize) -> Option<&'static Arc<EventLoop>> {
    let id = slot.load(Ordering::SeqCst);
    if id == 0 {
        None
    } else {
        Some(&loops()[id - 1])
    }
}

/// Pin an event to a loop: keep an earlier assignment, else adopt the
/// preferred loop, else round-robin.
fn pin_loop(slot: &AtomicUsize, prefer: Option<usize>) -> &'static Arc<EventLoop> {
    if let Some(lop) = loop_by_slot(slot) {
        return lop;
    }
    let lop = match prefer {
        Some(id) => &loops()[id % nr_loops()],
        None => assign_loop(),
    };
    slot.store(lop.id + 1, Ordering::SeqCst);
    lop
}

fn make_wake_fds() -> (i32, i32) {
    #[cfg(target_os = "linux")]
    {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0, "eventfd: {}", std::io::Error::last_os_error());
        (fd, fd)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        for fd in fds {
            unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
        }
        (fds[0], fds[1])
    }
}

impl EventLoop {
    fn start(id: usize) -> Arc<Self> {
        let (wake_rfd, wake_wfd) = make_wake_fds();
        let mut poller = Poller::new().expect("event loop poller");
        poller.add(wake_rfd, POLL_IN).expect("wake fd registration");

        #[cfg(not(target_os = "linux"))]
        let sigpipe = {
            let mut fds = [0i32; 2];
            assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
            for fd in fds {
                unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) };
            }
            poller.add(fds[0], POLL_IN).expect("signal pipe registration");
            fds
        };

        let lop = Arc::new(Self {
            id,
            wake_rfd,
            wake_wfd,
            wake_pending: AtomicU32::new(0),
            ctl: Ring::new(CTL_RING_SIZE, 0).expect("control ring geometry is static"),
            epoch: AtomicU64::new(1),
            rcu_q: SpinLock::new(VecDeque::new()),
            inner: UnsafeCell::new(LoopInner {
                poller,
                streams: HashMap::new(),
                timers: BinaryHeap::new(),
                asyncs: Vec::new(),
                signals: HashMap::new(),
                timer_seq: 0,
                #[cfg(target_os = "linux")]
                sigfd: -1,
                #[cfg(target_os = "linux")]
                sigmask: unsafe {
                    let mut set = std::mem::zeroed();
                    libc::sigemptyset(&mut set);
                    set
                },
                #[cfg(not(target_os = "linux"))]
                sigpipe_rfd: sigpipe[0],
            }),
            thread: OnceCell::new(),
            #[cfg(not(target_os = "linux"))]
            sigpipe_wfd: AtomicUsize::new(sigpipe[1] as usize),
        });

        let worker = lop.clone();
        let t = thread::spawn(
            Some(id % config::nr_cpus()),
            true,
            Box::new(move |me| {
                worker.run(me);
                0
            }),
        )
        .expect("event loop thread");
        t.wakeup().expect("event loop wakeup");
        let _ = lop.thread.set(t);
        log::info!("event loop {} is up", id);
        lop
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn wake(&self) {
        if self.wake_pending.swap(1, Ordering::SeqCst) == 0 {
            let token: u64 = 1;
            unsafe {
                libc::write(
                    self.wake_wfd,
                    &token as *const u64 as *const libc::c_void,
                    std::mem::size_of::<u64>(),
                )
            };
        }
    }

    fn submit(&self, msg: CtlMsg) {
        let raw = Box::into_raw(Box::new(msg)) as usize;
        while !self.ctl.enqueue(raw) {
            std::thread::yield_now();
        }
        self.wake();
    }

    /// Submit with an applied-acknowledgement, unless we are already on
    /// this loop (where removal is immediate at the next apply phase and
    /// blocking would deadlock).
    fn submit_ack<F: FnOnce(Option<Arc<Completion>>) -> CtlMsg>(&self, make: F) {
        if current_loop_id() == Some(self.id) {
            self.submit(make(None));
            return;
        }
        let done = Arc::new(Completion::new());
        self.submit(make(Some(done.clone())));
        done.wait();
    }

    // ------------------------------------------------------------------
    // Loop thread
    // ------------------------------------------------------------------

    fn run(self: &Arc<Self>, me: &Arc<UThread>) {
        CURRENT_LOOP.with(|c| c.set(self.id));
        // Safety: this thread is the only one to ever touch `inner`.
        let inner = unsafe { &mut *self.inner.get() };
        let mut events: Vec<PollEvent> = Vec::with_capacity(128);

        while !me.should_stop() {
            let timeout = self.next_timeout(inner);
            events.clear();
            if let Err(err) = inner.poller.wait(timeout, &mut events) {
                log::error!("loop {}: poll failed: {}", self.id, err);
            }

            self.wake_pending.store(0, Ordering::SeqCst);
            self.drain_wake_fd();
            self.apply_ctl(inner);
            self.dispatch_io(inner, &events);
            self.run_timers(inner);
            self.run_asyncs(inner);
            self.epoch.fetch_add(1, Ordering::SeqCst);
            rcu::run_ready(self);
        }
    }

    fn next_timeout(&self, inner: &LoopInner) -> i32 {
        // The RCU grace detector needs every loop to tick.
        let mut timeout = config::config().rcu_interval_ms.max(1);
        if let Some(Reverse(top)) = inner.timers.peek() {
            timeout = timeout.min(top.deadline.saturating_sub(now_ms()));
        }
        timeout.min(i32::MAX as u64) as i32
    }

    fn drain_wake_fd(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.wake_rfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    fn apply_ctl(&self, inner: &mut LoopInner) {
        while let Some(raw) = self.ctl.dequeue() {
            // Safety: submit() boxed the message.
            let msg = *unsafe { Box::from_raw(raw as *mut CtlMsg) };
            match msg {
                CtlMsg::StreamAdd(stream) => {
                    let mask = stream.mask.load(Ordering::SeqCst);
                    if let Err(err) = inner.poller.add(stream.fd, mask) {
                        log::warn!("loop {}: cannot watch fd {}: {}", self.id, stream.fd, err);
                        clear_bit(EV_ATTACHED_BIT, &stream.state);
                        continue;
                    }
                    inner.streams.insert(stream.fd, stream);
                }
                CtlMsg::StreamMod(stream) => {
                    let mask = stream.mask.load(Ordering::SeqCst);
                    if let Err(err) = inner.poller.modify(stream.fd, mask) {
                        log::warn!("loop {}: cannot re-arm fd {}: {}", self.id, stream.fd, err);
                    }
                }
                CtlMsg::StreamDel(stream, done) => {
                    if inner.streams.remove(&stream.fd).is_some() {
                        let _ = inner.poller.delete(stream.fd);
                    }
                    clear_bit(EV_DEAD_BIT, &stream.state);
                    clear_bit(EV_ATTACHED_BIT, &stream.state);
                    // Unpin so a re-add may migrate to another loop.
                    stream.lop.store(0, Ordering::SeqCst);
                    if let Some(done) = done {
                        done.complete();
                    }
                }
                CtlMsg::TimerAdd(timer, deadline, gen) => {
                    inner.timer_seq += 1;
                    inner.timers.push(Reverse(TimerEntry {
                        deadline,
                        seq: inner.timer_seq,
                        gen,
                        timer,
                    }));
                }
                CtlMsg::TimerAck(done) => {
                    if let Some(done) = done {
                        done.complete();
                    }
                }
                CtlMsg::AsyncAdd(async_ev) => {
                    inner.asyncs.push(async_ev);
                }
                CtlMsg::AsyncDel(async_ev, done) => {
                    inner.asyncs.retain(|a| !Arc::ptr_eq(a, &async_ev));
                    clear_bit(EV_ATTACHED_BIT, &async_ev.state);
                    async_ev.lop.store(0, Ordering::SeqCst);
                    if let Some(done) = done {
                        done.complete();
                    }
                }
                CtlMsg::SignalAdd(signal) => self.signal_attach(inner, signal),
                CtlMsg::SignalDel(signal, done) => {
                    self.signal_detach(inner, &signal);
                    if let Some(done) = done {
                        done.complete();
                    }
                }
            }
        }
    }

    fn dispatch_io(&self, inner: &mut LoopInner, events: &[PollEvent]) {
        for ev in events {
            if ev.fd == self.wake_rfd {
                continue;
            }
            #[cfg(target_os = "linux")]
            if ev.fd == inner.sigfd {
                self.dispatch_signalfd(inner);
                continue;
            }
            #[cfg(not(target_os = "linux"))]
            if ev.fd == inner.sigpipe_rfd {
                self.dispatch_sigpipe(inner);
                continue;
            }
            let Some(stream) = inner.streams.get(&ev.fd) else {
                continue;
            };
            if test_bit(EV_DEAD_BIT, &stream.state) {
                continue;
            }
            (stream.cb)(stream, ev.events);
        }
    }

    fn run_timers(&self, inner: &mut LoopInner) {
        let now = now_ms();
        let mut due = Vec::new();
        loop {
            match inner.timers.peek() {
                Some(Reverse(top)) if top.deadline <= now => {}
                _ => break,
            }
            let Reverse(entry) = inner.timers.pop().expect("peeked entry vanished");
            // Stale generations were re-keyed or deleted since insertion.
            if entry.gen == entry.timer.gen.load(Ordering::SeqCst)
                && test_bit(EV_ATTACHED_BIT, &entry.timer.state)
            {
                clear_bit(EV_ATTACHED_BIT, &entry.timer.state);
                due.push(entry.timer);
            }
        }
        for timer in due {
            (timer.cb)();
        }
    }

    fn run_asyncs(&self, inner: &mut LoopInner) {
        for async_ev in &inner.asyncs {
            if async_ev.pending.swap(0, Ordering::SeqCst) != 0 {
                (async_ev.cb)();
            }
        }
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    #[cfg(target_os = "linux")]
    fn signal_attach(&self, inner: &mut LoopInner, signal: Arc<UevSignal>) {
        unsafe {
            libc::sigaddset(&mut inner.sigmask, signal.signo);
            libc::pthread_sigmask(libc::SIG_BLOCK, &inner.sigmask, std::ptr::null_mut());
            let fd = libc::signalfd(
                inner.sigfd,
                &inner.sigmask,
                libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
            );
            if fd < 0 {
                log::error!("loop {}: signalfd: {}", self.id, std::io::Error::last_os_error());
                return;
            }
            if inner.sigfd < 0 {
                if let Err(err) = inner.poller.add(fd, POLL_IN) {
                    log::error!("loop {}: cannot watch signalfd: {}", self.id, err);
                    libc::close(fd);
                    return;
                }
                inner.sigfd = fd;
            }
        }
        inner.signals.insert(signal.signo, signal);
    }

    #[cfg(target_os = "linux")]
    fn signal_detach(&self, inner: &mut LoopInner, signal: &Arc<UevSignal>) {
        if inner.signals.remove(&signal.signo).is_none() {
            return;
        }
        unsafe {
            libc::sigdelset(&mut inner.sigmask, signal.signo);
            if inner.sigfd >= 0 {
                libc::signalfd(
                    inner.sigfd,
                    &inner.sigmask,
                    libc::SFD_NONBLOCK | libc::SFD_CLOEXEC,
                );
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn dispatch_signalfd(&self, inner: &mut LoopInner) {
        loop {
            let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
            let n = unsafe {
                libc::read(
                    inner.sigfd,
                    &mut info as *mut _ as *mut libc::c_void,
                    std::mem::size_of::<libc::signalfd_siginfo>(),
                )
            };
            if n != std::mem::size_of::<libc::signalfd_siginfo>() as isize {
                break;
            }
            if let Some(signal) = inner.signals.get(&(info.ssi_signo as i32)) {
                (signal.cb)(info.ssi_signo as i32);
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn signal_attach(&self, inner: &mut LoopInner, signal: Arc<UevSignal>) {
        inner.signals.insert(signal.signo, signal);
    }

    #[cfg(not(target_os = "linux"))]
    fn signal_detach(&self, inner: &mut LoopInner, signal: &Arc<UevSignal>) {
        inner.signals.remove(&signal.signo);
    }

    #[cfg(not(target_os = "linux"))]
    fn dispatch_sigpipe(&self, inner: &mut LoopInner) {
        loop {
            let mut signo: i32 = 0;
            let n = unsafe {
                libc::read(
                    inner.sigpipe_rfd,
                    &mut signo as *mut i32 as *mut libc::c_void,
                    std::mem::size_of::<i32>(),
                )
            };
            if n != std::mem::size_of::<i32>() as isize {
                break;
            }
            if let Some(signal) = inner.signals.get(&signo) {
                (signal.cb)(signo);
            }
        }
    }
}

// ============================================================================
// Stream API
// ============================================================================

impl UevStream {
    pub fn new<F: Fn(&Arc<UevStream>, u32) + Send + Sync + 'static>(
        fd: i32,
        cb: F,
    ) -> Arc<Self> {
        Arc::new(Self {
            fd,
            mask: AtomicU32::new(0),
            state: AtomicUsize::new(0),
            lop: AtomicUsize::new(0),
            cb: Box::new(cb),
        })
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn mask(&self) -> u32 {
        self.mask.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self) -> bool {
        test_bit(EV_ATTACHED_BIT, &self.state)
    }

    /// Register interest on a loop (sticky across delete/re-add).
    pub fn add(self: &Arc<Self>, mask: u32) -> Result<()> {
        self.add_on(None, mask)
    }

    pub fn add_on(self: &Arc<Self>, loop_id: Option<usize>, mask: u32) -> Result<()> {
        if test_and_set_bit(EV_ATTACHED_BIT, &self.state) {
            return Err(RtError::AlreadyRegistered);
        }
        clear_bit(EV_DEAD_BIT, &self.state);
        self.mask.store(mask, Ordering::SeqCst);
        pin_loop(&self.lop, loop_id).submit(CtlMsg::StreamAdd(self.clone()));
        Ok(())
    }

    /// Swap the interest mask in place.
    pub fn modify(self: &Arc<Self>, mask: u32) -> Result<()> {
        if !self.is_attached() {
            return Err(RtError::NotRegistered);
        }
        self.mask.store(mask, Ordering::SeqCst);
        loop_by_slot(&self.lop)
            .ok_or(RtError::NotRegistered)?
            .submit(CtlMsg::StreamMod(self.clone()));
        Ok(())
    }

    /// Mark the event dead and schedule its removal; no new callback will
    /// start once this returns.
    pub fn delete_async(self: &Arc<Self>) -> Result<()> {
        if !self.is_attached() {
            return Err(RtError::NotRegistered);
        }
        if test_and_set_bit(EV_DEAD_BIT, &self.state) {
            return Ok(());
        }
        loop_by_slot(&self.lop)
            .ok_or(RtError::NotRegistered)?
            .submit(CtlMsg::StreamDel(self.clone(), None));
        Ok(())
    }

    /// Remove the event and only return once its callback cannot be
    /// running anymore. Must not be called from this event's own callback.
    pub fn delete_sync(self: &Arc<Self>) -> Result<()> {
        if !self.is_attached() {
            return Err(RtError::NotRegistered);
        }
        test_and_set_bit(EV_DEAD_BIT, &self.state);
        loop_by_slot(&self.lop)
            .ok_or(RtError::NotRegistered)?
            .submit_ack(|done| CtlMsg::StreamDel(self.clone(), done));
        Ok(())
    }

    /// The loop this stream is pinned to, if any.
    pub fn loop_id(&self) -> Option<usize> {
        loop_by_slot(&self.lop).map(|l| l.id)
    }
}

// ============================================================================
// Timer API
// ============================================================================

impl UevTimer {
    pub fn new<F: Fn() + Send + Sync + 'static>(cb: F) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicUsize::new(0),
            gen: AtomicU64::new(0),
            lop: AtomicUsize::new(0),
            cb: Box::new(cb),
        })
    }

    pub fn is_pending(&self) -> bool {
        test_bit(EV_ATTACHED_BIT, &self.state)
    }

    /// Arm (or re-key) the timer `delay_ms` from now; it fires once.
    pub fn add(self: &Arc<Self>, delay_ms: u64) -> Result<()> {
        let gen = self.gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.fetch_or(1 << EV_ATTACHED_BIT, Ordering::SeqCst);
        let deadline = now_ms() + delay_ms;
        pin_loop(&self.lop, None).submit(CtlMsg::TimerAdd(self.clone(), deadline, gen));
        Ok(())
    }

    /// Re-key a pending timer (same as re-adding).
    pub fn modify(self: &Arc<Self>, delay_ms: u64) -> Result<()> {
        self.add(delay_ms)
    }

    /// Disarm; on return the callback is not running and will not fire.
    pub fn delete_sync(self: &Arc<Self>) {
        self.gen.fetch_add(1, Ordering::SeqCst);
        clear_bit(EV_ATTACHED_BIT, &self.state);
        if let Some(lop) = loop_by_slot(&self.lop) {
            lop.submit_ack(CtlMsg::TimerAck);
            self.lop.store(0, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// Async API
// ============================================================================

impl UevAsync {
    pub fn new<F: Fn() + Send + Sync + 'static>(cb: F) -> Arc<Self> {
        Arc::new(Self {
            pending: AtomicU32::new(0),
            state: AtomicUsize::new(0),
            lop: AtomicUsize::new(0),
            cb: Box::new(cb),
        })
    }

    pub fn register(self: &Arc<Self>) -> Result<()> {
        self.register_on(None)
    }

    pub fn register_on(self: &Arc<Self>, loop_id: Option<usize>) -> Result<()> {
        if test_and_set_bit(EV_ATTACHED_BIT, &self.state) {
            return Err(RtError::AlreadyRegistered);
        }
        pin_loop(&self.lop, loop_id).submit(CtlMsg::AsyncAdd(self.clone()));
        Ok(())
    }

    /// Request a callback run on the owning loop. Emissions coalesce: many
    /// emits before the loop gets around to it produce one run.
    pub fn emit(&self) -> Result<()> {
        if !test_bit(EV_ATTACHED_BIT, &self.state) {
            return Err(RtError::NotRegistered);
        }
        if self.pending.swap(1, Ordering::SeqCst) == 0 {
            loop_by_slot(&self.lop).ok_or(RtError::NotRegistered)?.wake();
        }
        Ok(())
    }

    pub fn unregister(self: &Arc<Self>) -> Result<()> {
        if !test_bit(EV_ATTACHED_BIT, &self.state) {
            return Err(RtError::NotRegistered);
        }
        loop_by_slot(&self.lop)
            .ok_or(RtError::NotRegistered)?
            .submit_ack(|done| CtlMsg::AsyncDel(self.clone(), done));
        Ok(())
    }
}

// ============================================================================
// Signal API
// ============================================================================

static SIGNAL_CLAIMS: SpinLock<Vec<(i32, usize)>> = SpinLock::new(Vec::new());

#[cfg(not(target_os = "linux"))]
mod sigpipe {
    use super::*;

    /// signo -> write end of the claiming loop's signal pipe.
    pub(super) static SIG_WFDS: Lazy<Vec<AtomicUsize>> =
        Lazy::new(|| (0..64).map(|_| AtomicUsize::new(0)).collect());

    pub(super) extern "C" fn handler(signo: libc::c_int) {
        let wfd = SIG_WFDS[signo as usize].load(Ordering::SeqCst);
        if wfd != 0 {
            unsafe {
                libc::write(
                    wfd as i32,
                    &signo as *const i32 as *const libc::c_void,
                    std::mem::size_of::<i32>(),
                );
            }
        }
    }
}

impl UevSignal {
    /// Route `signo` to `cb`, dispatched on one chosen loop's thread. A
    /// signal can be claimed by at most one registration process-wide.
    pub fn register<F: Fn(i32) + Send + Sync + 'static>(
        signo: i32,
        cb: F,
    ) -> Result<Arc<Self>> {
        let lop = {
            let mut claims = SIGNAL_CLAIMS.lock();
            if claims.iter().any(|&(s, _)| s == signo) {
                return Err(RtError::AlreadyRegistered);
            }
            let lop = assign_loop();
            claims.push((signo, lop.id));
            lop
        };

        let signal = Arc::new(Self {
            signo,
            lop: AtomicUsize::new(lop.id + 1),
            cb: Box::new(cb),
        });

        unsafe {
            #[cfg(target_os = "linux")]
            {
                // Keep the default disposition from firing; delivery goes
                // through the loop's signalfd.
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, signo);
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
            }
            #[cfg(not(target_os = "linux"))]
            {
                sigpipe::SIG_WFDS[signo as usize]
                    .store(lop.sigpipe_wfd.load(Ordering::SeqCst), Ordering::SeqCst);
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = sigpipe::handler as usize;
                libc::sigaction(signo, &action, std::ptr::null_mut());
            }
        }

        lop.submit(CtlMsg::SignalAdd(signal.clone()));
        Ok(signal)
    }

    pub fn signo(&self) -> i32 {
        self.signo
    }

    /// Deliver `signo` straight to the claiming loop's thread, which has it
    /// blocked and routed to its handler.
    pub fn raise(&self) -> Result<()> {
        let lop = loop_by_slot(&self.lop).ok_or(RtError::NotRegistered)?;
        let thread = lop.thread.get().ok_or(RtError::NotRegistered)?;
        let rc = unsafe { libc::pthread_kill(thread.pthread_handle(), self.signo) };
        if rc != 0 {
            return Err(RtError::Io(std::io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }

    pub fn unregister(self: &Arc<Self>) -> Result<()> {
        {
            let mut claims = SIGNAL_CLAIMS.lock();
            let before = claims.len();
            claims.retain(|&(s, _)| s != self.signo);
            if claims.len() == before {
                return Err(RtError::NotRegistered);
            }
        }
        loop_by_slot(&self.lop)
            .ok_or(RtError::NotRegistered)?
            .submit_ack(|done| CtlMsg::SignalDel(self.clone(), done));
        Ok(())
    }
}

pub use rcu::{call_rcu, synchronize_rcu};

// Transports.
//
// An `Xprt` wraps one socket plus its event registration and is shared by
// reference counting: the creator gets one reference and the owning
// server's list holds exactly one more for as long as the xprt is linked.
// Behavior hangs off an `XprtOps` trait object; the framework drives it
// from the owning event loop (accept/connect bookkeeping, handshake,
// recv/send readiness, shutdown).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use socket2::{Domain, Protocol, Socket, Type};
use std::os::fd::{FromRawFd, IntoRawFd};

use crate::error::{Result, RtError};
use crate::event::{UevStream, EVENT_READ, EVENT_WRITE, POLL_ERR, POLL_HUP};
use crate::net::server::Server;
use crate::utils::bitops::{test_and_set_bit, test_bit};

// Creation flags.
pub const XPRT_TCPSERV: u32 = 0x1;
pub const XPRT_TCPCLNT: u32 = 0x2;
pub const XPRT_OPT_NONBLOCK: u32 = 0x4;
pub const XPRT_RDREADY: u32 = 0x8;
pub const XPRT_WRREADY: u32 = 0x10;

// State bits (also the `on_changed` notification values).
pub const XPRT_ST_INITIALIZING: u32 = 0x1;
pub const XPRT_ST_OPENED: u32 = 0x2;
pub const XPRT_ST_CONNECTED: u32 = 0x4;
pub const XPRT_ST_SHUT_RD: u32 = 0x8;
pub const XPRT_ST_SHUT_WR: u32 = 0x10;
pub const XPRT_ST_CLOSED: u32 = 0x20;
pub const XPRT_ST_DESTROYED: u32 = 0x40;
pub const XPRT_ST_CONNREFUSED: u32 = 0x80;

pub const SHUT_RD: u32 = XPRT_ST_SHUT_RD;
pub const SHUT_WR: u32 = XPRT_ST_SHUT_WR;
pub const SHUT_RDWR: u32 = SHUT_RD | SHUT_WR;

// Private lifecycle bits kept in `lifecycle`.
const XL_HANDSHAKEN: usize = 0;
const XL_RELEASED: usize = 1;
const XL_CONNECTING: usize = 2;

pub trait XprtOps: Send + Sync {
    /// The read side is ready; drain until `WouldBlock` or shut down.
    fn on_recv(&self, xprt: &Arc<Xprt>) -> Result<()>;

    /// The write side is ready; drain queued output and disable write
    /// interest when nothing is left.
    fn on_send(&self, _xprt: &Arc<Xprt>) -> Result<()> {
        Ok(())
    }

    /// State transition notification (`XPRT_ST_*` value).
    fn on_changed(&self, _xprt: &Arc<Xprt>, _state: u32) {}

    /// Optional pre-open handshake; return `WouldBlock` to be retried on
    /// the next readiness.
    fn do_handshake(&self, _xprt: &Arc<Xprt>) -> Result<()> {
        Ok(())
    }

    /// Final hook before the socket closes.
    fn on_shutdown(&self, _xprt: &Arc<Xprt>) {}
}

pub struct Xprt {
    flags: u32,
    state: AtomicU32,
    lifecycle: AtomicUsize,
    fd: i32,
    ev: once_cell::sync::OnceCell<Arc<UevStream>>,
    server: Weak<Server>,
    ops: Arc<dyn XprtOps>,
    user: AtomicUsize,
}

impl Xprt {
    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn state(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub fn server(&self) -> Option<Arc<Server>> {
        self.server.upgrade()
    }

    /// One free slot for per-xprt user state.
    pub fn set_user(&self, val: usize) {
        self.user.store(val, Ordering::SeqCst);
    }

    pub fn user(&self) -> usize {
        self.user.load(Ordering::SeqCst)
    }

    pub fn is_listener(&self) -> bool {
        self.flags & XPRT_TCPSERV != 0
    }

    /// The socket's locally bound address (useful after binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        // Safety: the socket is borrowed, not adopted; forget() below keeps
        // ownership with the xprt.
        let sock = unsafe { Socket::from_raw_fd(self.fd) };
        let addr = sock.local_addr();
        std::mem::forget(sock);
        addr?
            .as_socket()
            .ok_or_else(|| RtError::InvalidArgument("not an inet socket".into()))
    }

    fn set_state(&self, bits: u32) -> u32 {
        self.state.fetch_or(bits, Ordering::SeqCst)
    }

    fn notify(self: &Arc<Self>, state: u32) {
        self.ops.on_changed(self, state);
    }

    // ------------------------------------------------------------------
    // Socket I/O helpers for ops implementations
    // ------------------------------------------------------------------

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let n = unsafe {
            libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        Err(io_error())
    }

    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let n = unsafe {
            libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())
        };
        if n >= 0 {
            return Ok(n as usize);
        }
        Err(io_error())
    }

    /// Arm write readiness (edge honored by the poller).
    pub fn enable_write(self: &Arc<Self>) -> Result<()> {
        if let Some(ev) = self.ev.get() {
            ev.modify(ev.mask() | EVENT_WRITE)?;
        }
        Ok(())
    }

    /// Drop write interest once the writer has drained.
    pub fn disable_write(self: &Arc<Self>) -> Result<()> {
        if let Some(ev) = self.ev.get() {
            ev.modify(ev.mask() & !EVENT_WRITE)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drive the shutdown state machine; once both directions are down the
    /// xprt detaches from its loop and server and the socket closes.
    pub fn shutdown(self: &Arc<Self>, how: u32) {
        let prev = self.set_state(how & SHUT_RDWR);
        let now = prev | (how & SHUT_RDWR);
        if now & SHUT_RDWR != SHUT_RDWR {
            self.notify(now & SHUT_RDWR);
            return;
        }
        self.release(false);
    }

    /// Synchronous teardown: on return the event callback cannot run again
    /// and the server reference is gone.
    pub fn destroy(self: &Arc<Self>) {
        self.set_state(SHUT_RDWR | XPRT_ST_DESTROYED);
        self.release(true);
    }

    fn release(self: &Arc<Self>, sync: bool) {
        if test_and_set_bit(XL_RELEASED, &self.lifecycle) {
            return;
        }
        if let Some(ev) = self.ev.get() {
            let rc = if sync { ev.delete_sync() } else { ev.delete_async() };
            if let Err(err) = rc {
                log::debug!("xprt {}: event removal: {}", self.fd, err);
            }
        }
        if let Some(server) = self.server.upgrade() {
            server.detach(self);
        }
        self.ops.on_shutdown(self);
        // Peers see the FIN now even while stray references linger; the fd
        // itself closes with the last one.
        unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) };
        self.set_state(XPRT_ST_CLOSED);
        self.notify(XPRT_ST_CLOSED);
        log::debug!("xprt {} closed", self.fd);
    }
}

impl Drop for Xprt {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

// ============================================================================
// Creation
// ============================================================================

/// Classify the thread's errno for the transport's error contract.
fn io_error() -> RtError {
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => RtError::WouldBlock,
        Some(libc::EINTR) => RtError::Interrupted,
        Some(libc::EPIPE) | Some(libc::ECONNRESET) => RtError::BrokenPipe,
        _ => RtError::Io(err),
    }
}

fn make_socket(addr: SocketAddr, flags: u32) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    // The event loops assume readiness-driven fds even when the caller did
    // not pass XPRT_OPT_NONBLOCK.
    sock.set_nonblocking(true)?;
    if flags & XPRT_TCPSERV != 0 {
        sock.set_reuse_address(true)?;
        sock.bind(&addr.into())?;
        sock.listen(128)?;
    }
    Ok(sock)
}

fn event_mask(flags: u32) -> u32 {
    let mut mask = 0;
    if flags & (XPRT_RDREADY | XPRT_TCPSERV) != 0 {
        mask |= EVENT_READ;
    }
    if flags & XPRT_WRREADY != 0 {
        mask |= EVENT_WRITE;
    }
    if mask == 0 {
        mask = EVENT_READ;
    }
    mask
}

/// Create a transport bound to `server`. The returned reference belongs to
/// the caller; the server list holds its own.
pub fn create_xprt(
    server: &Arc<Server>,
    flags: u32,
    addr: SocketAddr,
    ops: Arc<dyn XprtOps>,
) -> Result<Arc<Xprt>> {
    if flags & (XPRT_TCPSERV | XPRT_TCPCLNT) == 0
        || flags & XPRT_TCPSERV != 0 && flags & XPRT_TCPCLNT != 0
    {
        return Err(RtError::InvalidArgument(
            "exactly one of XPRT_TCPSERV/XPRT_TCPCLNT is required".into(),
        ));
    }

    let sock = make_socket(addr, flags)?;
    let mut connecting = false;
    if flags & XPRT_TCPCLNT != 0 {
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => connecting = true,
            Err(err) if err.raw_os_error() == Some(libc::ECONNREFUSED) => {
                return Err(RtError::Io(err));
            }
            Err(err) => return Err(RtError::Io(err)),
        }
    }

    let fd = sock.into_raw_fd();
    let xprt = Arc::new(Xprt {
        flags,
        state: AtomicU32::new(XPRT_ST_INITIALIZING),
        lifecycle: AtomicUsize::new(if connecting { 1 << XL_CONNECTING } else { 0 }),
        fd,
        ev: once_cell::sync::OnceCell::new(),
        server: Arc::downgrade(server),
        ops,
        user: AtomicUsize::new(0),
    });

    server.attach(&xprt)?;
    if let Err(err) = register_events(&xprt, connecting) {
        server.detach(&xprt);
        return Err(err);
    }

    if !connecting {
        open_xprt(&xprt);
    }
    log::debug!(
        "created xprt {} ({})",
        fd,
        if flags & XPRT_TCPSERV != 0 { "listener" } else { "client" }
    );
    Ok(xprt)
}

fn register_events(xprt: &Arc<Xprt>, connecting: bool) -> Result<()> {
    let weak = Arc::downgrade(xprt);
    let ev = UevStream::new(xprt.fd, move |_ev, mask| {
        if let Some(xprt) = weak.upgrade() {
            dispatch(&xprt, mask);
        }
    });
    let mut mask = event_mask(xprt.flags);
    if connecting {
        mask |= EVENT_WRITE;
    }
    ev.add(mask)?;
    xprt.ev.set(ev).map_err(|_| RtError::AlreadyRegistered)?;
    Ok(())
}

/// Run the handshake (if any) and flip the xprt open.
fn open_xprt(xprt: &Arc<Xprt>) {
    if !test_bit(XL_HANDSHAKEN, &xprt.lifecycle) {
        match xprt.ops.do_handshake(xprt) {
            Ok(()) => {
                test_and_set_bit(XL_HANDSHAKEN, &xprt.lifecycle);
            }
            Err(RtError::WouldBlock) => return,
            Err(err) => {
                log::warn!("xprt {}: handshake failed: {}", xprt.fd, err);
                xprt.shutdown(SHUT_RDWR);
                return;
            }
        }
    }
    let prev = xprt.set_state(XPRT_ST_OPENED | XPRT_ST_CONNECTED);
    if prev & XPRT_ST_OPENED == 0 {
        xprt.notify(XPRT_ST_OPENED);
    }
}

fn dispatch(xprt: &Arc<Xprt>, mask: u32) {
    if mask & (POLL_ERR | POLL_HUP) != 0 && mask & EVENT_READ == 0 {
        xprt.shutdown(SHUT_RDWR);
        return;
    }

    if test_bit(XL_CONNECTING, &xprt.lifecycle) && mask & (EVENT_WRITE | POLL_ERR) != 0 {
        finish_connect(xprt);
        return;
    }

    if mask & EVENT_READ != 0 {
        if xprt.is_listener() {
            accept_ready(xprt);
        } else if !test_bit(XL_HANDSHAKEN, &xprt.lifecycle) {
            open_xprt(xprt);
        } else if let Err(err) = xprt.ops.on_recv(xprt) {
            match err {
                RtError::WouldBlock | RtError::Interrupted => {}
                err => {
                    log::debug!("xprt {}: recv path: {}", xprt.fd, err);
                    xprt.shutdown(SHUT_RDWR);
                    return;
                }
            }
        }
    }

    if mask & EVENT_WRITE != 0 && xprt.state() & XPRT_ST_SHUT_WR == 0 {
        if let Err(err) = xprt.ops.on_send(xprt) {
            match err {
                RtError::WouldBlock | RtError::Interrupted => {}
                err => {
                    log::debug!("xprt {}: send path: {}", xprt.fd, err);
                    xprt.shutdown(SHUT_RDWR);
                }
            }
        }
    }
}

fn finish_connect(xprt: &Arc<Xprt>) {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            xprt.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    crate::utils::bitops::clear_bit(XL_CONNECTING, &xprt.lifecycle);
    if rc != 0 || err != 0 {
        log::debug!("xprt {}: connect failed: {}", xprt.fd, err);
        xprt.notify(XPRT_ST_CONNREFUSED);
        xprt.shutdown(SHUT_RDWR);
        return;
    }
    // Connected; drop the artificial write interest unless asked for.
    if xprt.flags & XPRT_WRREADY == 0 {
        let _ = xprt.disable_write();
    }
    open_xprt(xprt);
}

fn accept_ready(listener: &Arc<Xprt>) {
    loop {
        let fd = unsafe { libc::accept(listener.fd, std::ptr::null_mut(), std::ptr::null_mut()) };
        if fd < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::ECONNABORTED) => return,
                Some(libc::EINTR) => continue,
                _ => {
                    log::warn!("xprt {}: accept: {}", listener.fd, err);
                    return;
                }
            }
        }
        unsafe {
            let fl = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, fl | libc::O_NONBLOCK);
        }

        let Some(server) = listener.server.upgrade() else {
            unsafe { libc::close(fd) };
            return;
        };
        let conn = Arc::new(Xprt {
            flags: XPRT_RDREADY | (listener.flags & XPRT_OPT_NONBLOCK),
            state: AtomicU32::new(XPRT_ST_INITIALIZING | XPRT_ST_CONNECTED),
            lifecycle: AtomicUsize::new(0),
            fd,
            ev: once_cell::sync::OnceCell::new(),
            server: Arc::downgrade(&server),
            ops: listener.ops.clone(),
            user: AtomicUsize::new(0),
        });
        if let Err(err) = server.attach(&conn) {
            log::warn!("xprt {}: rejecting connection: {}", listener.fd, err);
            continue;
        }
        if let Err(err) = register_events(&conn, false) {
            log::warn!("xprt {}: connection events: {}", listener.fd, err);
            server.detach(&conn);
            continue;
        }
        open_xprt(&conn);
        log::debug!("xprt {} accepted connection {}", listener.fd, fd);
    }
}

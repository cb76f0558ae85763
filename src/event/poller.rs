// OS readiness multiplexer.
//
// epoll on Linux; a poll(2)-backed shim elsewhere (which also means edge
// triggering degrades to level triggering there). One poller per event
// loop, touched only by its owning thread.

use std::io;

use crate::error::{Result, RtError};

pub const POLL_IN: u32 = 0x1;
pub const POLL_OUT: u32 = 0x2;
pub const POLL_ERR: u32 = 0x4;
pub const POLL_HUP: u32 = 0x8;
pub const POLL_EDGE: u32 = 0x10;

#[derive(Clone, Copy, Debug)]
pub struct PollEvent {
    pub fd: i32,
    pub events: u32,
}

#[cfg(target_os = "linux")]
pub struct Poller {
    epfd: i32,
}

#[cfg(target_os = "linux")]
impl Poller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(RtError::last_os_error());
        }
        Ok(Self { epfd })
    }

    fn epoll_events(mask: u32) -> u32 {
        let mut events = 0u32;
        if mask & POLL_IN != 0 {
            events |= libc::EPOLLIN as u32;
        }
        if mask & POLL_OUT != 0 {
            events |= libc::EPOLLOUT as u32;
        }
        if mask & POLL_EDGE != 0 {
            events |= libc::EPOLLET as u32;
        }
        events
    }

    fn ctl(&self, op: i32, fd: i32, mask: u32) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: Self::epoll_events(mask),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(RtError::last_os_error());
        }
        Ok(())
    }

    pub fn add(&mut self, fd: i32, mask: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, mask)
    }

    pub fn modify(&mut self, fd: i32, mask: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, mask)
    }

    pub fn delete(&mut self, fd: i32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0)
    }

    /// Wait up to `timeout_ms` and translate readiness back into the
    /// portable mask.
    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<()> {
        const MAX_EVENTS: usize = 128;
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { std::mem::zeroed() };
        let n = unsafe {
            libc::epoll_wait(self.epfd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(RtError::Io(err));
        }
        for ev in events.iter().take(n as usize) {
            let mut mask = 0u32;
            if ev.events & libc::EPOLLIN as u32 != 0 {
                mask |= POLL_IN;
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                mask |= POLL_OUT;
            }
            if ev.events & libc::EPOLLERR as u32 != 0 {
                mask |= POLL_ERR;
            }
            if ev.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                mask |= POLL_HUP;
            }
            out.push(PollEvent {
                fd: ev.u64 as i32,
                events: mask,
            });
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
impl Drop for Poller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

#[cfg(not(target_os = "linux"))]
pub struct Poller {
    interest: Vec<(i32, u32)>,
}

#[cfg(not(target_os = "linux"))]
impl Poller {
    pub fn new() -> Result<Self> {
        Ok(Self {
            interest: Vec::new(),
        })
    }

    pub fn add(&mut self, fd: i32, mask: u32) -> Result<()> {
        if self.interest.iter().any(|&(f, _)| f == fd) {
            return Err(RtError::AlreadyRegistered);
        }
        self.interest.push((fd, mask));
        Ok(())
    }

    pub fn modify(&mut self, fd: i32, mask: u32) -> Result<()> {
        match self.interest.iter_mut().find(|(f, _)| *f == fd) {
            Some(slot) => {
                slot.1 = mask;
                Ok(())
            }
            None => Err(RtError::NotRegistered),
        }
    }

    pub fn delete(&mut self, fd: i32) -> Result<()> {
        let before = self.interest.len();
        self.interest.retain(|&(f, _)| f != fd);
        if self.interest.len() == before {
            return Err(RtError::NotRegistered);
        }
        Ok(())
    }

    pub fn wait(&mut self, timeout_ms: i32, out: &mut Vec<PollEvent>) -> Result<()> {
        let mut fds: Vec<libc::pollfd> = self
            .interest
            .iter()
            .map(|&(fd, mask)| {
                let mut events = 0i16;
                if mask & POLL_IN != 0 {
                    events |= libc::POLLIN;
                }
                if mask & POLL_OUT != 0 {
                    events |= libc::POLLOUT;
                }
                libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                }
            })
            .collect();
        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(RtError::Io(err));
        }
        for pfd in fds.iter().filter(|p| p.revents != 0) {
            let mut mask = 0u32;
            if pfd.revents & libc::POLLIN != 0 {
                mask |= POLL_IN;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                mask |= POLL_OUT;
            }
            if pfd.revents & libc::POLLERR != 0 {
                mask |= POLL_ERR;
            }
            if pfd.revents & libc::POLLHUP != 0 {
                mask |= POLL_HUP;
            }
            out.push(PollEvent {
                fd: pfd.fd,
                events: mask,
            });
        }
        Ok(())
    }
}

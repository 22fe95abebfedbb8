//! Thin wrappers over the Linux syscalls the engine needs directly:
//! `epoll` and a non-blocking `pipe2`.
//!
//! Everything else goes through `std`, `socket2` or `nix`.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;

use crate::error::{Error, Result};

/// Read interest: edge-triggered, one-shot, with peer half-close reporting.
pub const INTEREST_READ: u32 =
    (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;

/// Write interest: edge-triggered, one-shot, with peer half-close reporting.
pub const INTEREST_WRITE: u32 =
    (libc::EPOLLOUT | libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;

/// Persistent level-triggered read interest, for the listener and signal pipe.
pub const INTEREST_LEVEL_READ: u32 = libc::EPOLLIN as u32;

pub const EV_READABLE: u32 = libc::EPOLLIN as u32;
pub const EV_WRITABLE: u32 = libc::EPOLLOUT as u32;
pub const EV_HANGUP: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

/// Pack a connection slot and its epoch into an epoll token.
#[inline]
pub fn token(slot: usize, epoch: u32) -> u64 {
    (u64::from(epoch) << 32) | (slot as u64 & 0xffff_ffff)
}

/// Inverse of [`token`].
#[inline]
pub fn split_token(token: u64) -> (usize, u32) {
    ((token & 0xffff_ffff) as usize, (token >> 32) as u32)
}

/// One readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub flags: u32,
}

impl Event {
    #[inline]
    pub fn is_hangup(&self) -> bool {
        self.flags & EV_HANGUP != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.flags & EV_READABLE != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags & EV_WRITABLE != 0
    }
}

/// Owned epoll instance. Safe to share between threads; `epoll_ctl` and
/// `epoll_wait` are thread-safe in the kernel.
#[derive(Debug)]
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os("epoll_create1"));
        }
        // Safety: fd was just returned by the kernel and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        let mut event = libc::epoll_event {
            events: interest,
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    pub fn add(&self, fd: RawFd, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest, token)
    }

    /// Re-arm a one-shot registration.
    pub fn modify(&self, fd: RawFd, interest: u32, token: u64) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest, token)
    }

    pub fn delete(&self, fd: RawFd) -> std::result::Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0)
    }

    /// Wait for events; `timeout_ms < 0` blocks indefinitely.
    ///
    /// `EINTR` is reported as zero events.
    pub fn wait(&self, events: &mut Vec<Event>, raw: &mut [libc::epoll_event], timeout_ms: i32) -> Result<usize> {
        events.clear();
        let max = raw.len().min(i32::MAX as usize) as libc::c_int;
        let n = unsafe { libc::epoll_wait(self.fd.as_raw_fd(), raw.as_mut_ptr(), max, timeout_ms) };
        if n < 0 {
            return match Errno::last() {
                Errno::EINTR => Ok(0),
                errno => Err(Error::Os {
                    context: "epoll_wait",
                    errno,
                }),
            };
        }
        for ev in &raw[..n as usize] {
            events.push(Event {
                token: ev.u64,
                flags: ev.events,
            });
        }
        Ok(events.len())
    }
}

/// Non-blocking, close-on-exec pipe: `(read end, write end)`.
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(Error::last_os("pipe2"));
    }
    // Safety: both descriptors were just created and are owned by us.
    unsafe { Ok((OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))) }
}

/// Drain a non-blocking descriptor into `out`, stopping at `EAGAIN` or EOF.
pub fn read_all_nonblocking(fd: RawFd, out: &mut Vec<u8>) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n > 0 {
            out.extend_from_slice(&buf[..n as usize]);
            continue;
        }
        if n < 0 && Errno::last() == Errno::EINTR {
            continue;
        }
        break;
    }
}

/// Single `write(2)` of one byte; safe to call from a signal handler.
#[inline]
pub fn write_byte(fd: RawFd, byte: u8) -> bool {
    let ret = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
    ret == 1
}

//! Signal-to-pipe bridge.
//!
//! The handler performs a single `write(2)` of the signal number to every
//! registered pipe and nothing else. The reactor watches the read end like
//! any other descriptor and interprets the bytes on its own thread.
//!
//! Several servers may live in one process (tests do this); each owns a
//! pipe and receives every signal.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use crate::error::{Error, Result};
use crate::sys;

/// Signals routed through the pipe.
pub const HANDLED: [Signal; 4] = [Signal::SIGINT, Signal::SIGTERM, Signal::SIGALRM, Signal::SIGPIPE];

const MAX_PIPES: usize = 16;

/// Write ends of every live signal pipe; `-1` marks a free slot.
static PIPES: [AtomicI32; MAX_PIPES] = [const { AtomicI32::new(-1) }; MAX_PIPES];

/// Handlers currently between loading a write end and finishing with it.
static IN_HANDLER: AtomicUsize = AtomicUsize::new(0);

extern "C" fn on_signal(signo: libc::c_int) {
    // write(2) may clobber errno of the interrupted code
    let saved = unsafe { *libc::__errno_location() };
    IN_HANDLER.fetch_add(1, Ordering::SeqCst);
    for slot in &PIPES {
        let fd = slot.load(Ordering::SeqCst);
        if fd >= 0 {
            sys::write_byte(fd, signo as u8);
        }
    }
    IN_HANDLER.fetch_sub(1, Ordering::SeqCst);
    unsafe { *libc::__errno_location() = saved };
}

fn install_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    for signal in HANDLED {
        // Safety: the handler only touches atomics and calls write(2).
        unsafe { sigaction(signal, &action) }.map_err(|errno| Error::Os {
            context: "sigaction",
            errno,
        })?;
    }
    Ok(())
}

/// What a byte read from the pipe means to the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Stop,
    Tick,
    Ignore,
}

impl SignalEvent {
    pub fn from_byte(byte: u8) -> Self {
        match Signal::try_from(i32::from(byte)) {
            Ok(Signal::SIGINT) | Ok(Signal::SIGTERM) => SignalEvent::Stop,
            Ok(Signal::SIGALRM) => SignalEvent::Tick,
            _ => SignalEvent::Ignore,
        }
    }
}

/// A registered signal pipe. Unregistered on drop.
pub struct SignalPipe {
    read: OwnedFd,
    write: Arc<OwnedFd>,
    slot: usize,
}

impl SignalPipe {
    /// Create a pipe, register it, and install the process signal handlers.
    pub fn install() -> Result<Self> {
        let (read, write) = sys::pipe()?;
        let raw = write.as_raw_fd();
        let slot = PIPES
            .iter()
            .position(|s| s.compare_exchange(-1, raw, Ordering::AcqRel, Ordering::Relaxed).is_ok())
            .ok_or(Error::Os {
                context: "register signal pipe",
                errno: nix::errno::Errno::EMFILE,
            })?;
        let pipe = Self {
            read,
            write: Arc::new(write),
            slot,
        };
        install_handlers()?;
        debug!(slot, "signal pipe installed");
        Ok(pipe)
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }

    /// Drain all pending signal bytes.
    pub fn drain(&self) -> Vec<SignalEvent> {
        let mut bytes = Vec::new();
        sys::read_all_nonblocking(self.read.as_raw_fd(), &mut bytes);
        bytes.into_iter().map(SignalEvent::from_byte).collect()
    }

    /// Handle that injects a stop request through this pipe.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            write: Arc::clone(&self.write),
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        PIPES[self.slot].store(-1, Ordering::SeqCst);
        // A handler that loaded the old value may still write to it; the
        // write end must outlive that write or it could hit a reused fd.
        while IN_HANDLER.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }
}

/// Stops a running server from another thread, exactly as SIGTERM would.
#[derive(Clone)]
pub struct ShutdownHandle {
    write: Arc<OwnedFd>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        sys::write_byte(self.write.as_raw_fd(), Signal::SIGTERM as i32 as u8);
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("fd", &self.write.as_raw_fd())
            .finish()
    }
}

/// Arm (or re-arm) the process `SIGALRM` for `secs` seconds.
pub fn arm_alarm(secs: u64) {
    let secs = u32::try_from(secs).unwrap_or(u32::MAX).max(1);
    let _ = nix::unistd::alarm::set(secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_mapping() {
        assert_eq!(SignalEvent::from_byte(libc::SIGINT as u8), SignalEvent::Stop);
        assert_eq!(SignalEvent::from_byte(libc::SIGTERM as u8), SignalEvent::Stop);
        assert_eq!(SignalEvent::from_byte(libc::SIGALRM as u8), SignalEvent::Tick);
        assert_eq!(SignalEvent::from_byte(libc::SIGPIPE as u8), SignalEvent::Ignore);
        assert_eq!(SignalEvent::from_byte(0), SignalEvent::Ignore);
    }

    #[test]
    fn test_shutdown_handle_writes_stop() {
        let pipe = SignalPipe::install().unwrap();
        pipe.drain();
        let handle = pipe.shutdown_handle();
        handle.clone().shutdown();
        assert!(pipe.drain().contains(&SignalEvent::Stop));
    }

    #[test]
    fn test_raised_signal_reaches_every_pipe() {
        let a = SignalPipe::install().unwrap();
        let b = SignalPipe::install().unwrap();
        nix::sys::signal::raise(Signal::SIGPIPE).unwrap();
        assert!(a.drain().contains(&SignalEvent::Ignore));
        assert!(b.drain().contains(&SignalEvent::Ignore));
    }

    #[test]
    fn test_drop_waits_for_running_handler() {
        use std::sync::mpsc;
        use std::time::Duration;

        let pipe = SignalPipe::install().unwrap();
        let write_fd = pipe.write.as_raw_fd();
        // stand in for a handler that already loaded this pipe's write end
        IN_HANDLER.fetch_add(1, Ordering::SeqCst);
        let (done_tx, done_rx) = mpsc::channel();
        let dropper = std::thread::spawn(move || {
            drop(pipe);
            done_tx.send(()).unwrap();
        });

        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(PIPES.iter().all(|s| s.load(Ordering::SeqCst) != write_fd));

        IN_HANDLER.fetch_sub(1, Ordering::SeqCst);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        dropper.join().unwrap();
    }
}

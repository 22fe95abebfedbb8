//! # Reactor: the readiness dispatch loop
//!
//! Runs on the thread that calls [`Server::run`](crate::Server::run). It:
//! 1. Waits on epoll with no timeout
//! 2. Accepts new connections and submits `Init` tasks
//! 3. Turns socket readiness into `Readable` / `Writable` / `Close` tasks
//! 4. Reads signal bytes from the signal pipe (stop, tick)
//! 5. Drives the idle timer and submits `Close` for expired connections
//!
//! The reactor never reads from or writes to a connection.

use std::io::ErrorKind;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};

use crate::context::{Phase, ServerContext, Stats, Task};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::signal::{self, SignalEvent, SignalPipe};
use crate::sys::{self, Event, INTEREST_LEVEL_READ};
use crate::timer::HashedWheelTimer;

/// Token of the listening socket.
pub const LISTENER_TOKEN: u64 = u64::MAX;
/// Token of the signal pipe read end.
pub const SIGNAL_TOKEN: u64 = u64::MAX - 1;

/// Events fetched per `epoll_wait`.
const EVENTS_PER_WAIT: usize = 1024;

pub struct Reactor {
    ctx: Arc<ServerContext>,
    pool: WorkerPool<Task>,
    listener: TcpListener,
    signals: SignalPipe,
    timer: HashedWheelTimer,
    /// Current epoch per slot; bumped on every accept.
    epochs: Vec<u32>,
    idle_timeout: Duration,
    /// Listener removed from epoll after a hard accept error.
    listener_paused: bool,
    running: bool,
}

impl Reactor {
    /// Register the listener and signal pipe with the context's epoll.
    pub fn new(
        ctx: Arc<ServerContext>,
        pool: WorkerPool<Task>,
        listener: TcpListener,
        signals: SignalPipe,
        timer: HashedWheelTimer,
        idle_timeout: Duration,
    ) -> Result<Self> {
        ctx.epoll
            .add(listener.as_raw_fd(), INTEREST_LEVEL_READ, LISTENER_TOKEN)
            .map_err(|errno| Error::Os {
                context: "register listener",
                errno,
            })?;
        ctx.epoll
            .add(signals.read_fd(), INTEREST_LEVEL_READ, SIGNAL_TOKEN)
            .map_err(|errno| Error::Os {
                context: "register signal pipe",
                errno,
            })?;
        let epochs = vec![0; ctx.capacity()];
        Ok(Self {
            ctx,
            pool,
            listener,
            signals,
            timer,
            epochs,
            idle_timeout,
            listener_paused: false,
            running: false,
        })
    }

    pub fn signals(&self) -> &SignalPipe {
        &self.signals
    }

    pub fn listener(&self) -> &TcpListener {
        &self.listener
    }

    /// Run until SIGINT/SIGTERM (or a [`ShutdownHandle`](crate::ShutdownHandle)).
    pub fn run(&mut self) -> Result<()> {
        let tick_secs = self.timer.interval().as_secs().max(1);
        let mut raw = vec![libc::epoll_event { events: 0, u64: 0 }; EVENTS_PER_WAIT];
        let mut events = Vec::with_capacity(EVENTS_PER_WAIT);

        self.running = true;
        signal::arm_alarm(tick_secs);

        while self.running {
            self.ctx.epoll.wait(&mut events, &mut raw, -1)?;

            let mut tick_due = false;
            for event in &events {
                match event.token {
                    LISTENER_TOKEN => self.accept_all(),
                    SIGNAL_TOKEN => {
                        for sig in self.signals.drain() {
                            match sig {
                                SignalEvent::Stop => {
                                    info!("stop requested");
                                    self.running = false;
                                }
                                SignalEvent::Tick => tick_due = true,
                                SignalEvent::Ignore => {}
                            }
                        }
                    }
                    _ => self.on_connection_event(event),
                }
            }

            if tick_due {
                self.tick();
                signal::arm_alarm(tick_secs);
            }
        }

        self.shutdown();
        Ok(())
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let slot = stream.as_raw_fd() as usize;
                    if slot >= self.epochs.len() {
                        warn!(slot, capacity = self.epochs.len(), %peer, "connection table full, dropping");
                        continue;
                    }
                    self.epochs[slot] = self.epochs[slot].wrapping_add(1);
                    let epoch = self.epochs[slot];
                    Stats::bump(&self.ctx.stats.accepted);
                    trace!(slot, epoch, %peer, "accepted");

                    let task = Task::new(slot, epoch, Phase::Init { stream, peer });
                    match self.pool.append_task(task) {
                        Ok(()) => self.timer.add_timer(slot, Instant::now() + self.idle_timeout),
                        Err(rejected) => {
                            Stats::bump(&self.ctx.stats.rejected);
                            warn!(slot, %peer, "worker queue full, dropping new connection");
                            // dropping the task closes the stream
                            drop(rejected);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionAborted) => continue,
                Err(e) => {
                    // EMFILE and friends: the listener stays readable, so stop watching it
                    warn!(error = %e, "accept failed, pausing listener until next tick");
                    self.pause_listener();
                    break;
                }
            }
        }
    }

    fn on_connection_event(&mut self, event: &Event) {
        let (slot, epoch) = sys::split_token(event.token);
        if self.epochs.get(slot) != Some(&epoch) {
            trace!(slot, epoch, "event for previous connection ignored");
            return;
        }

        let phase = if event.is_hangup() {
            Phase::Close
        } else if event.is_readable() {
            Phase::Readable
        } else if event.is_writable() {
            Phase::Writable
        } else {
            return;
        };
        let closing = matches!(phase, Phase::Close);
        let name = phase.name();

        match self.pool.append_task(Task::new(slot, epoch, phase)) {
            Ok(()) if closing => self.timer.del_timer(slot),
            Ok(()) => self.timer.add_timer(slot, Instant::now() + self.idle_timeout),
            Err(_) => {
                Stats::bump(&self.ctx.stats.rejected);
                warn!(slot, phase = name, "worker queue full, task rejected");
                if closing {
                    // already due: the next tick retries the close
                    self.timer.add_timer(slot, Instant::now());
                }
            }
        }
    }

    fn pause_listener(&mut self) {
        if self.listener_paused {
            return;
        }
        if let Err(errno) = self.ctx.epoll.delete(self.listener.as_raw_fd()) {
            debug!(%errno, "listener deregister failed");
        }
        self.listener_paused = true;
    }

    fn resume_listener(&mut self) {
        if !self.listener_paused {
            return;
        }
        match self
            .ctx
            .epoll
            .add(self.listener.as_raw_fd(), INTEREST_LEVEL_READ, LISTENER_TOKEN)
        {
            Ok(()) => {
                self.listener_paused = false;
                info!("listener resumed");
            }
            Err(errno) => warn!(%errno, "listener re-register failed, retrying next tick"),
        }
    }

    /// Advance the wheel and close every expired connection.
    fn tick(&mut self) {
        self.resume_listener();

        let mut expired = Vec::new();
        self.timer.tick(|slot| expired.push(slot));

        for slot in expired {
            let epoch = self.epochs[slot];
            Stats::bump(&self.ctx.stats.expired);
            debug!(slot, epoch, "idle timeout");
            if self.pool.append_task(Task::new(slot, epoch, Phase::Close)).is_err() {
                Stats::bump(&self.ctx.stats.rejected);
                warn!(slot, "worker queue full, idle close deferred");
                self.timer.add_timer(slot, Instant::now());
            }
        }
    }

    fn shutdown(&mut self) {
        if !self.listener_paused {
            let _ = self.ctx.epoll.delete(self.listener.as_raw_fd());
        }
        let _ = self.ctx.epoll.delete(self.signals.read_fd());
        self.pool.stop();

        let stats = &self.ctx.stats;
        info!(
            accepted = stats.accepted.load(Ordering::Relaxed),
            responses = stats.responses.load(Ordering::Relaxed),
            rejected = stats.rejected.load(Ordering::Relaxed),
            expired = stats.expired.load(Ordering::Relaxed),
            live = stats.live_connections(),
            "reactor stopped"
        );
    }
}

//! State shared by the reactor and every worker.

use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use crate::cache::FileCache;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::sys::Epoll;

/// What a task asks the connection state machine to do.
#[derive(Debug)]
pub enum Phase {
    /// Take ownership of a freshly accepted stream.
    Init { stream: TcpStream, peer: SocketAddr },
    Readable,
    Writable,
    Close,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Init { .. } => "init",
            Phase::Readable => "readable",
            Phase::Writable => "writable",
            Phase::Close => "close",
        }
    }
}

/// One unit of work for the pool: a phase for the connection in `slot`,
/// valid only while the slot still carries `epoch`.
#[derive(Debug)]
pub struct Task {
    pub slot: usize,
    pub epoch: u32,
    pub phase: Phase,
}

impl Task {
    pub fn new(slot: usize, epoch: u32, phase: Phase) -> Self {
        Self { slot, epoch, phase }
    }
}

/// Counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct Stats {
    pub live: AtomicUsize,
    pub accepted: AtomicU64,
    pub responses: AtomicU64,
    pub rejected: AtomicU64,
    pub expired: AtomicU64,
}

impl Stats {
    #[inline]
    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct ServerContext {
    pub(crate) epoll: Epoll,
    /// Connection table indexed by descriptor number; the mutex is the
    /// per-descriptor lock.
    pub(crate) slots: Box<[Mutex<Connection>]>,
    pub(crate) cache: FileCache,
    doc_root: PathBuf,
    read_buffer: usize,
    pub(crate) stats: Stats,
}

impl ServerContext {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let slots = (0..config.max_connections)
            .map(|slot| Mutex::new(Connection::new(slot)))
            .collect();
        Ok(Self {
            epoll: Epoll::new()?,
            slots,
            cache: FileCache::new(config.cache.max_bytes, config.cache.max_items),
            doc_root: config.root.clone(),
            read_buffer: config.read_buffer,
            stats: Stats::default(),
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    #[inline]
    pub fn read_buffer(&self) -> usize {
        self.read_buffer
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn cache(&self) -> &FileCache {
        &self.cache
    }

    /// Run `task` under its slot's lock. Pool handler entry point.
    pub fn dispatch(&self, task: Task) {
        let Some(cell) = self.slots.get(task.slot) else {
            trace!(slot = task.slot, "task for slot outside the table");
            return;
        };
        let mut conn = cell.lock().unwrap_or_else(PoisonError::into_inner);
        conn.process(self, task);
    }
}

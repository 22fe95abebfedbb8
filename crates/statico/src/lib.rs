//! # statico: static-file HTTP/1.1 server engine
//!
//! One reactor thread turns epoll readiness into tasks; a fixed worker pool
//! runs the per-connection state machine; responses are written straight
//! out of memory-mapped files; idle connections are reclaimed by a hashed
//! wheel timer driven by `SIGALRM`.
//!
//! ## Architecture
//!
//! ```text
//!   listener ─┐                     ┌──────────────┐
//!   sockets  ─┼─► epoll ─► Reactor ─┤ WorkerPool   ├─► Connection (slot mutex)
//!   signals  ─┘    ▲        │       │ (ArrayQueue) │        │
//!   (self-pipe)    │        ▼       └──────────────┘        ▼
//!                  │   HashedWheelTimer                 FileCache (mmap)
//!                  └──────── re-arm one-shot ◄──────────────┘
//! ```
//!
//! | Module         | Role                                              |
//! |----------------|---------------------------------------------------|
//! | `reactor`      | event loop, accept, signal handling, idle ticks   |
//! | `pool`         | bounded FIFO + fixed worker threads               |
//! | `connection`   | read / parse / respond / keep-alive state machine |
//! | `cache`        | mmap file cache, LRU by bytes and items           |
//! | `timer`        | hashed wheel idle timer                           |
//! | `http`         | header parser, response encoder, MIME lookup      |
//!
//! ## Usage
//!
//! ```ignore
//! use statico::{Server, ServerConfig};
//!
//! let config = ServerConfig::load(None)?.root("www").port(8080);
//! Server::bind(config)?.run()?;
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod context;
pub mod env;
pub mod error;
pub mod http;
pub mod logging;
pub mod pool;
pub mod reactor;
pub mod server;
pub mod signal;
pub mod sys;
pub mod timer;

pub use cache::{CacheEntry, FileCache};
pub use config::ServerConfig;
pub use connection::Connection;
pub use context::{Phase, ServerContext, Task};
pub use error::{Error, Result};
pub use logging::LogLevel;
pub use pool::{QueueFull, WorkerPool};
pub use server::Server;
pub use signal::ShutdownHandle;
pub use timer::HashedWheelTimer;

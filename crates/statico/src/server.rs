//! Server assembly: listener, context, worker pool, signal pipe, reactor.

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::info;

use crate::config::ServerConfig;
use crate::context::{ServerContext, Task};
use crate::error::{Error, Result};
use crate::pool::WorkerPool;
use crate::reactor::Reactor;
use crate::signal::{ShutdownHandle, SignalPipe};
use crate::timer::HashedWheelTimer;

/// A bound, not yet running server.
///
/// ```ignore
/// let server = Server::bind(ServerConfig::load(None)?)?;
/// let stop = server.shutdown_handle();
/// std::thread::spawn(move || server.run());
/// // ...
/// stop.shutdown();
/// ```
pub struct Server {
    reactor: Reactor,
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
}

impl Server {
    /// Validate `config`, bind the listener and start the worker pool.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;
        let listener = bind_listener(addr, config.backlog)?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::io("listener local_addr", e))?;

        let ctx = Arc::new(ServerContext::new(&config)?);
        let signals = SignalPipe::install()?;

        let handler_ctx = Arc::clone(&ctx);
        let pool = WorkerPool::start(config.pool.workers, config.pool.max_tasks, move |task: Task| {
            handler_ctx.dispatch(task)
        })?;

        let timer = HashedWheelTimer::new(config.timer.buckets, config.tick_interval(), ctx.capacity());
        let reactor = Reactor::new(
            Arc::clone(&ctx),
            pool,
            listener,
            signals,
            timer,
            config.idle_timeout(),
        )?;

        info!(
            %local_addr,
            root = %config.root.display(),
            workers = config.pool.workers,
            max_connections = config.max_connections,
            "listening"
        );
        Ok(Self {
            reactor,
            ctx,
            local_addr,
        })
    }

    /// Serve until stopped by SIGINT/SIGTERM or a [`ShutdownHandle`].
    pub fn run(mut self) -> Result<()> {
        self.reactor.run()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.reactor.signals().shutdown_handle()
    }

    /// Connections currently held by the slot table.
    pub fn live_connections(&self) -> usize {
        self.ctx.stats().live_connections()
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }
}

/// Non-blocking listener with `SO_REUSEADDR` and an explicit backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let bind_err = |source| Error::Bind {
        addr: addr.to_string(),
        source,
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(backlog).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let root = tempfile::tempdir().unwrap();
        let config = ServerConfig::default().host("127.0.0.1").port(0).root(root.path());
        let server = Server::bind(config).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.live_connections(), 0);
    }

    #[test]
    fn test_bind_rejects_invalid_config() {
        let config = ServerConfig::default().port(0).root("/definitely/not/here");
        assert!(matches!(Server::bind(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_bind_conflict_is_bind_error() {
        let root = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        // an active listener on the same port blocks a second listen
        let config = ServerConfig::default().host("127.0.0.1").port(port).root(root.path());
        assert!(matches!(Server::bind(config), Err(Error::Bind { .. })));
    }
}

//! statico HTTP/1.1 static-file server
//!
//! Serves files under a document root with an epoll one-shot reactor and a
//! fixed worker pool. Keep-alive, mmap zero-copy responses, idle timeout.
//!
//! Usage:
//!     ./target/release/statico-httpd [--config statico.json] [--root ./www] [--port 8080]
//!
//! Settings are layered: built-in defaults, then the JSON config file, then
//! `STATICO_*` environment variables, then these flags.
//!
//! Benchmark:
//!     wrk -t4 -c100 -d10s http://127.0.0.1:8080/index.html

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use statico::{logging, LogLevel, Server, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "statico-httpd", about = "Static-file HTTP/1.1 server", version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Document root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Idle connection timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// off, error, warn, info, debug, trace (or 0-5)
    #[arg(short, long)]
    log_level: Option<LogLevel>,
}

impl Cli {
    /// Flags win over file and environment.
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(root) = self.root {
            config = config.root(root);
        }
        if let Some(host) = self.host {
            config = config.host(host);
        }
        if let Some(port) = self.port {
            config = config.port(port);
        }
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        if let Some(secs) = self.timeout {
            config = config.idle_timeout_secs(secs);
        }
        if let Some(level) = self.log_level {
            config = config.log_level(level);
        }
        config
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match cli.config.as_deref() {
        Some(path) => ServerConfig::load(Some(path))
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ServerConfig::load(None).context("loading configuration")?,
    };
    let config = cli.apply(config);
    logging::init(config.log_level);

    let server = Server::bind(config).context("starting server")?;
    info!(addr = %server.local_addr(), "statico-httpd ready");
    server.run().context("server loop failed")?;
    info!("statico-httpd exiting");
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("statico-httpd: {e:#}");
        std::process::exit(1);
    }
}

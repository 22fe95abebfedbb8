//! Server configuration
//!
//! Defaults, overridden by an optional JSON file, overridden by `STATICO_*`
//! environment variables. The binary applies command-line flags last.
//!
//! # File format
//!
//! ```json
//! {
//!   "host": "0.0.0.0",
//!   "port": 8080,
//!   "backlog": 1024,
//!   "timeout": 10,
//!   "root": "www",
//!   "loglevel": "info",
//!   "threadpool": { "workers": 8, "maxtask": 10000 },
//!   "cachepool": { "maxsize": 1073741824, "maxitem": 10000 },
//!   "timer": { "granularity": 10, "interval": 1 }
//! }
//! ```
//!
//! Every key is optional.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::{env_override, ENV_PREFIX};
use crate::error::{Error, Result};
use crate::logging::LogLevel;

pub mod defaults {
    pub const HOST: &str = "0.0.0.0";
    pub const PORT: u16 = 8080;
    pub const BACKLOG: i32 = 1024;
    pub const IDLE_TIMEOUT_SECS: u64 = 10;
    pub const ROOT: &str = "www";
    pub const MAX_CONNECTIONS: usize = 10240;
    pub const READ_BUFFER: usize = 4096;
    pub const MAX_TASKS: usize = 10000;
    pub const CACHE_MAX_BYTES: u64 = 1 << 30;
    pub const CACHE_MAX_ITEMS: usize = 10000;
    pub const TIMER_BUCKETS: usize = 10;
    pub const TIMER_INTERVAL_SECS: u64 = 1;
}

/// Worker pool sizing (`"threadpool"` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    /// Max queued tasks before submission is rejected.
    #[serde(rename = "maxtask")]
    pub max_tasks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_tasks: defaults::MAX_TASKS,
        }
    }
}

/// File cache limits (`"cachepool"` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(rename = "maxsize")]
    pub max_bytes: u64,
    #[serde(rename = "maxitem")]
    pub max_items: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: defaults::CACHE_MAX_BYTES,
            max_items: defaults::CACHE_MAX_ITEMS,
        }
    }
}

/// Idle timer wheel (`"timer"` section).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Number of wheel buckets.
    #[serde(rename = "granularity")]
    pub buckets: usize,
    /// Seconds per bucket; also the SIGALRM period.
    #[serde(rename = "interval")]
    pub interval_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            buckets: defaults::TIMER_BUCKETS,
            interval_secs: defaults::TIMER_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    /// Idle connection timeout in seconds.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    /// Document root.
    pub root: PathBuf,
    #[serde(rename = "loglevel")]
    pub log_level: LogLevel,
    /// Size of the descriptor-indexed connection table.
    pub max_connections: usize,
    /// Per-connection request header buffer.
    pub read_buffer: usize,
    #[serde(rename = "threadpool")]
    pub pool: PoolConfig,
    #[serde(rename = "cachepool")]
    pub cache: CacheConfig,
    pub timer: TimerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            backlog: defaults::BACKLOG,
            timeout_secs: defaults::IDLE_TIMEOUT_SECS,
            root: PathBuf::from(defaults::ROOT),
            log_level: LogLevel::default(),
            max_connections: defaults::MAX_CONNECTIONS,
            read_buffer: defaults::READ_BUFFER,
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            timer: TimerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults (or `path` if given) with environment overrides applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Parse a JSON configuration file. Missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io("read config file", e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Apply `STATICO_*` environment overrides.
    ///
    /// - `STATICO_HOST`, `STATICO_PORT`, `STATICO_BACKLOG`
    /// - `STATICO_TIMEOUT` - idle timeout seconds
    /// - `STATICO_ROOT` - document root
    /// - `STATICO_LOG_LEVEL`
    /// - `STATICO_MAX_CONNECTIONS`, `STATICO_READ_BUFFER`
    /// - `STATICO_WORKERS`, `STATICO_MAX_TASKS`
    /// - `STATICO_CACHE_MAX_BYTES`, `STATICO_CACHE_MAX_ITEMS`
    /// - `STATICO_TIMER_BUCKETS`, `STATICO_TIMER_INTERVAL`
    pub fn apply_env(&mut self) {
        let key = |name: &str| format!("{ENV_PREFIX}{name}");
        env_override(&key("HOST"), &mut self.host);
        env_override(&key("PORT"), &mut self.port);
        env_override(&key("BACKLOG"), &mut self.backlog);
        env_override(&key("TIMEOUT"), &mut self.timeout_secs);
        env_override(&key("ROOT"), &mut self.root);
        env_override(&key("LOG_LEVEL"), &mut self.log_level);
        env_override(&key("MAX_CONNECTIONS"), &mut self.max_connections);
        env_override(&key("READ_BUFFER"), &mut self.read_buffer);
        env_override(&key("WORKERS"), &mut self.pool.workers);
        env_override(&key("MAX_TASKS"), &mut self.pool.max_tasks);
        env_override(&key("CACHE_MAX_BYTES"), &mut self.cache.max_bytes);
        env_override(&key("CACHE_MAX_ITEMS"), &mut self.cache.max_items);
        env_override(&key("TIMER_BUCKETS"), &mut self.timer.buckets);
        env_override(&key("TIMER_INTERVAL"), &mut self.timer.interval_secs);
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("threadpool.workers", self.pool.workers),
            ("threadpool.maxtask", self.pool.max_tasks),
            ("timer.granularity", self.timer.buckets),
            ("timer.interval", self.timer.interval_secs as usize),
            ("max_connections", self.max_connections),
            ("read_buffer", self.read_buffer),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.backlog <= 0 {
            return Err(Error::Config("backlog must be greater than zero".into()));
        }
        if !self.root.is_dir() {
            return Err(Error::Config(format!(
                "document root {} is not a directory",
                self.root.display()
            )));
        }
        Ok(())
    }

    /// Resolve `host:port`.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| Error::io("resolve listen address", e))?
            .next()
            .ok_or_else(|| Error::Config(format!("cannot resolve host {:?}", self.host)))
    }

    #[inline]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[inline]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.timer.interval_secs)
    }

    // ── Builder-style setters ───────────────────────────────────────

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.pool.workers = n;
        self
    }

    pub fn idle_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, defaults::PORT);
        assert_eq!(config.timer.buckets, defaults::TIMER_BUCKETS);
        assert_eq!(config.idle_timeout(), Duration::from_secs(10));
        assert!(config.pool.workers >= 1);
    }

    #[test]
    fn test_from_json_uses_legacy_keys() {
        let config = ServerConfig::from_json(
            r#"{
                "host": "127.0.0.1",
                "port": 9000,
                "timeout": 30,
                "root": "/srv/www",
                "loglevel": "debug",
                "threadpool": { "workers": 3, "maxtask": 64 },
                "cachepool": { "maxsize": 4096, "maxitem": 2 },
                "timer": { "granularity": 60, "interval": 2 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9000);
        assert_eq!(config.timeout_secs, 30);
        assert_eq!(config.root, PathBuf::from("/srv/www"));
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.pool.workers, 3);
        assert_eq!(config.pool.max_tasks, 64);
        assert_eq!(config.cache.max_bytes, 4096);
        assert_eq!(config.cache.max_items, 2);
        assert_eq!(config.timer.buckets, 60);
        assert_eq!(config.tick_interval(), Duration::from_secs(2));
        // untouched keys keep defaults
        assert_eq!(config.backlog, defaults::BACKLOG);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{ "threadpool": { "workers": 2 } }"#).unwrap();
        assert_eq!(config.pool.workers, 2);
        assert_eq!(config.pool.max_tasks, defaults::MAX_TASKS);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(matches!(
            ServerConfig::from_json("{ \"port\": \"eighty\" }"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_validate() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::default().root(dir.path());
        assert!(config.validate().is_ok());

        assert!(matches!(config.clone().workers(0).validate(), Err(Error::Config(_))));
        assert!(matches!(
            ServerConfig::default().root(dir.path().join("missing")).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_listen_addr() {
        let config = ServerConfig::default().host("127.0.0.1").port(0);
        let addr = config.listen_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 0);
    }
}

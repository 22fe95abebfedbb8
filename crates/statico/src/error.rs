//! statico error types.
//!
//! Only startup and control-path failures surface as [`Error`]. Per-connection
//! I/O failures never escape the connection state machine; they close the
//! connection and are logged.

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A std I/O operation failed.
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// A raw syscall failed with errno.
    #[error("{context}: {errno}")]
    Os { context: &'static str, errno: Errno },
    /// Listener could not be bound or put into listening state.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Configuration file is not valid JSON for [`ServerConfig`](crate::ServerConfig).
    #[error("malformed configuration file: {0}")]
    ConfigParse(#[from] serde_json::Error),
    /// Worker pool queue is at capacity (or the pool is stopped).
    #[error("worker pool queue full")]
    QueueFull,
}

impl Error {
    pub(crate) fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    /// Capture the calling thread's errno.
    pub(crate) fn last_os(context: &'static str) -> Self {
        Self::Os {
            context,
            errno: Errno::last(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = Error::Os {
            context: "epoll_create1",
            errno: Errno::EMFILE,
        };
        let msg = err.to_string();
        assert!(msg.starts_with("epoll_create1: "));

        let err = Error::io(
            "open config",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(err.to_string(), "open config: gone");
    }

    #[test]
    fn test_config_parse_from_serde() {
        let parse_err = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: Error = parse_err.into();
        assert!(matches!(err, Error::ConfigParse(_)));
    }
}

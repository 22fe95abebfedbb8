//! Environment variable overrides
//!
//! Every tunable in [`ServerConfig`](crate::ServerConfig) can be overridden at
//! runtime with a `STATICO_*` variable. Values that fail to parse are ignored
//! and the configured value is kept.
//!
//! ```ignore
//! let mut workers = 4usize;
//! env_override("STATICO_WORKERS", &mut workers);
//! ```

use std::str::FromStr;

/// Prefix shared by all override variables.
pub const ENV_PREFIX: &str = "STATICO_";

/// Get environment variable parsed as `T`, `None` if unset or unparsable.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Overwrite `slot` with the parsed value of `key`, if any.
///
/// Returns `true` when an override was applied.
#[inline]
pub fn env_override<T>(key: &str, slot: &mut T) -> bool
where
    T: FromStr,
{
    match env_get_opt(key) {
        Some(v) => {
            *slot = v;
            true
        }
        None => false,
    }
}

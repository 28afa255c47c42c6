//! Environment variable helpers used by the runtime configuration
//!
//! ```ignore
//! use pktlink_core::env::{env_get, env_get_bool, env_get_millis};
//!
//! let backlog: i32 = env_get("PKTLINK_LISTEN_BACKLOG", 128);
//! let poll = env_get_millis("PKTLINK_POLL_TIMEOUT_MS", 100);
//! let verbose = env_get_bool("PKTLINK_VERBOSE", false);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`; unset or unparsable yields `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T` if set and valid.
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// "1", "true", "yes", "on" (any case) are true; other values are false.
/// Unset yields `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

/// Milliseconds from `key` as a `Duration`.
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_defaults() {
        let val: usize = env_get("__PKTLINK_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        assert!(env_get_bool("__PKTLINK_TEST_UNSET__", true));
        assert!(env_get_opt::<u32>("__PKTLINK_TEST_UNSET__").is_none());
        assert_eq!(
            env_get_millis("__PKTLINK_TEST_UNSET__", 250),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_parse_set_values() {
        std::env::set_var("__PKTLINK_TEST_NUM__", " 64 ");
        let val: i32 = env_get("__PKTLINK_TEST_NUM__", 0);
        assert_eq!(val, 64);

        std::env::set_var("__PKTLINK_TEST_NUM__", "lots");
        let val: i32 = env_get("__PKTLINK_TEST_NUM__", 7);
        assert_eq!(val, 7);
        std::env::remove_var("__PKTLINK_TEST_NUM__");
    }

    #[test]
    fn test_bool_variants() {
        for yes in ["1", "true", "YES", "on"] {
            std::env::set_var("__PKTLINK_TEST_BOOL__", yes);
            assert!(env_get_bool("__PKTLINK_TEST_BOOL__", false));
        }
        for no in ["0", "false", "nope"] {
            std::env::set_var("__PKTLINK_TEST_BOOL__", no);
            assert!(!env_get_bool("__PKTLINK_TEST_BOOL__", true));
        }
        std::env::remove_var("__PKTLINK_TEST_BOOL__");
    }
}

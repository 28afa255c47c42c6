//! Runtime configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables
//! 3. Library defaults (`config::defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use pktlink_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_env()
//!     .listen_backlog(32)
//!     .poll_timeout(Duration::from_millis(20));
//! config.validate()?;
//! ```

pub mod defaults;

use std::time::Duration;

use pktlink_core::env::{env_get, env_get_bool, env_get_millis};
use pktlink_core::log::{self, LogLevel};

/// Event loop and transport tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Events drained from epoll per wait
    pub max_events: usize,
    /// `listen(2)` backlog
    pub listen_backlog: i32,
    /// Wait slice used by `EventLoop::run`
    pub poll_timeout: Duration,
    /// Raise logging to debug level on `apply_logging`
    pub debug_logging: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `PKTLINK_MAX_EVENTS` - epoll batch size
    /// - `PKTLINK_LISTEN_BACKLOG` - listen backlog
    /// - `PKTLINK_POLL_TIMEOUT_MS` - wait slice in milliseconds
    /// - `PKTLINK_DEBUG` - debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            max_events: env_get("PKTLINK_MAX_EVENTS", defaults::MAX_EVENTS),
            listen_backlog: env_get("PKTLINK_LISTEN_BACKLOG", defaults::LISTEN_BACKLOG),
            poll_timeout: env_get_millis("PKTLINK_POLL_TIMEOUT_MS", defaults::POLL_TIMEOUT_MS),
            debug_logging: env_get_bool("PKTLINK_DEBUG", defaults::DEBUG_LOGGING),
        }
    }

    /// Library defaults only, no environment lookups. Used by tests.
    pub fn new() -> Self {
        Self {
            max_events: defaults::MAX_EVENTS,
            listen_backlog: defaults::LISTEN_BACKLOG,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            debug_logging: defaults::DEBUG_LOGGING,
        }
    }

    // Builder methods

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n;
        self
    }

    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    pub fn debug_logging(mut self, enable: bool) -> Self {
        self.debug_logging = enable;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_events == 0 {
            return Err(ConfigError::InvalidValue("max_events must be > 0"));
        }
        if self.max_events > 4096 {
            return Err(ConfigError::InvalidValue("max_events must be <= 4096"));
        }
        if self.listen_backlog <= 0 {
            return Err(ConfigError::InvalidValue("listen_backlog must be > 0"));
        }
        if self.poll_timeout.is_zero() {
            return Err(ConfigError::InvalidValue("poll_timeout must be > 0"));
        }
        if self.poll_timeout > Duration::from_millis(u16::MAX as u64) {
            return Err(ConfigError::InvalidValue("poll_timeout must be <= 65535ms"));
        }
        Ok(())
    }

    /// Raise the global log level to debug if `debug_logging` is set.
    pub fn apply_logging(&self) {
        if self.debug_logging && log::log_level() < LogLevel::Debug {
            log::set_log_level(LogLevel::Debug);
        }
    }

    /// Print configuration (for debugging)
    pub fn print(&self) {
        eprintln!("pktlink runtime configuration:");
        eprintln!("  max_events:      {}", self.max_events);
        eprintln!("  listen_backlog:  {}", self.listen_backlog);
        eprintln!("  poll_timeout:    {:?}", self.poll_timeout);
        eprintln!("  debug_logging:   {}", self.debug_logging);
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::new();
        assert_eq!(config.max_events, defaults::MAX_EVENTS);
        assert!(config.validate().is_ok());
        assert!(RuntimeConfig::from_env().max_events >= 1);
    }

    #[test]
    fn test_builder() {
        let config = RuntimeConfig::new()
            .max_events(8)
            .listen_backlog(4)
            .poll_timeout(Duration::from_millis(5));
        assert_eq!(config.max_events, 8);
        assert_eq!(config.listen_backlog, 4);
        assert_eq!(config.poll_timeout, Duration::from_millis(5));
    }

    #[test]
    fn test_validation() {
        assert!(RuntimeConfig::new().max_events(0).validate().is_err());
        assert!(RuntimeConfig::new().listen_backlog(0).validate().is_err());
        assert!(RuntimeConfig::new()
            .poll_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(RuntimeConfig::new()
            .poll_timeout(Duration::from_secs(120))
            .validate()
            .is_err());
    }
}

//! Leveled stderr logging for pktlink
//!
//! Every line carries a level and a component tag:
//!
//! ```text
//! W session: fd=7 unmatched ack seq=12
//! ```
//!
//! # Environment Variables
//!
//! - `PKTLINK_LOG_LEVEL=<level>` - off, error, warn, info, debug, trace (or 0-5)
//! - `PKTLINK_FLUSH_LOG=1` - flush stderr after each line
//!
//! # Usage
//!
//! ```ignore
//! use pktlink_core::{pk_debug, pk_warn};
//!
//! pk_debug!("connector", "fd={} accepted", fd);
//! pk_warn!("session", "fd={} short write {}/{}", fd, sent, total);
//! ```

use std::io::Write;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels, most severe first
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    /// Indexed by the numeric level
    const ALL: [LogLevel; 6] = [
        LogLevel::Off,
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    /// Numeric level; anything above 5 saturates to `Trace`.
    pub fn from_u8(v: u8) -> Self {
        Self::ALL[usize::from(v).min(Self::ALL.len() - 1)]
    }

    /// Lowercase name accepted by `PKTLINK_LOG_LEVEL`
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// One-letter line tag (`E`, `W`, `I`, `D`, `T`)
    pub fn prefix(&self) -> &'static str {
        const TAGS: [&str; 6] = ["", "E", "W", "I", "D", "T"];
        TAGS[*self as usize]
    }
}

impl FromStr for LogLevel {
    type Err = ();

    /// A level name (case-insensitive, `warning` allowed) or a digit 0-5.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return if usize::from(n) < Self::ALL.len() {
                Ok(Self::from_u8(n))
            } else {
                Err(())
            };
        }
        if s.eq_ignore_ascii_case("warning") {
            return Ok(LogLevel::Warn);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|level| level.name().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Read `PKTLINK_LOG_LEVEL` / `PKTLINK_FLUSH_LOG` once.
///
/// Runs implicitly on the first log call; an explicit `set_log_level`
/// before that wins over the environment.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    if let Ok(val) = std::env::var("PKTLINK_LOG_LEVEL") {
        if let Ok(level) = val.parse::<LogLevel>() {
            LOG_LEVEL.store(level as u8, Ordering::Relaxed);
        }
    }
    if let Ok(val) = std::env::var("PKTLINK_FLUSH_LOG") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level != LogLevel::Off && level <= log_level()
}

#[doc(hidden)]
pub fn _log_impl(level: LogLevel, component: &str, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let _ = write!(handle, "{} {}: ", level.prefix(), component);
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

// ============================================================================
// Public Macros
// ============================================================================

/// Error level log (shown unless logging is off)
#[macro_export]
macro_rules! pk_error {
    ($component:expr, $($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::LogLevel::Error,
            $component,
            format_args!($($arg)*)
        );
    }};
}

/// Warning level log
#[macro_export]
macro_rules! pk_warn {
    ($component:expr, $($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::LogLevel::Warn,
            $component,
            format_args!($($arg)*)
        );
    }};
}

/// Info level log
#[macro_export]
macro_rules! pk_info {
    ($component:expr, $($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::LogLevel::Info,
            $component,
            format_args!($($arg)*)
        );
    }};
}

/// Debug level log
#[macro_export]
macro_rules! pk_debug {
    ($component:expr, $($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::LogLevel::Debug,
            $component,
            format_args!($($arg)*)
        );
    }};
}

/// Trace level log (per-read detail of the receive state machine)
#[macro_export]
macro_rules! pk_trace {
    ($component:expr, $($arg:tt)*) => {{
        $crate::log::_log_impl(
            $crate::log::LogLevel::Trace,
            $component,
            format_args!($($arg)*)
        );
    }};
}

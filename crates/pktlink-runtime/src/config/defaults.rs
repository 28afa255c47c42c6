//! Library defaults for `RuntimeConfig`

/// Events drained from epoll per `run_once`
pub const MAX_EVENTS: usize = 64;

/// `listen(2)` backlog for server endpoints
pub const LISTEN_BACKLOG: i32 = 128;

/// How long `EventLoop::run` blocks in one wait before re-checking `quit`
pub const POLL_TIMEOUT_MS: u64 = 100;

/// Debug-level logging when built with `debug-logging`
pub const DEBUG_LOGGING: bool = cfg!(feature = "debug-logging");

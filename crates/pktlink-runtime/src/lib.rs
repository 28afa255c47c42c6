//! # pktlink-runtime
//!
//! Platform runtime for pktlink.
//!
//! This crate provides:
//! - `EventLoop`: single-threaded epoll readiness dispatcher
//! - `UnixTransport`: `AF_UNIX` stream sockets with peer pid lookup
//! - `Connector`: handle lifecycle and connect/disconnect fan-out
//! - `PacketSession`: packet reassembly, request/ack correlation, method dispatch
//! - `RuntimeConfig`: defaults plus environment overrides
//!
//! Everything here is single-threaded (`Rc`/`RefCell`). Run one loop per
//! thread; only `oneshot_send` blocks.

pub mod config;
pub mod error;
pub mod event_loop;
pub mod unix_transport;
pub mod connector;
pub mod session;

// Re-exports
pub use config::{ConfigError, RuntimeConfig};
pub use error::{SessionError, SessionResult};
pub use event_loop::{EventLoop, Readiness, WatchControl, WatchFn};
pub use unix_transport::UnixTransport;
pub use connector::{Connector, ConnectorEvent, EventCallback, EventCallbackFn, ReadableFn};
pub use session::{oneshot_send, Completion, MethodFn, MethodTable, PacketSession, ReceiveState};

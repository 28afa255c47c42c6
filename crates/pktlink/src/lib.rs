//! # pktlink - packet IPC over Unix domain sockets
//!
//! Request/acknowledgement messaging between processes on one host.
//! A [`Connector`] owns the sockets and watches them on an [`EventLoop`];
//! a [`PacketSession`] on top of it reassembles [`Packet`]s, matches ACKs
//! to outstanding requests and dispatches incoming requests to handlers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use pktlink::{Connector, EventLoop, MethodTable, Packet, PacketSession, Value};
//!
//! let ev = EventLoop::new()?;
//! let session = PacketSession::new(Connector::new(ev.clone()));
//!
//! // Server side
//! let methods = MethodTable::new().with("ping", |_pid, _fd, req| {
//!     Packet::create_reply(req, "i", &[Value::Int(42)]).ok()
//! });
//! session.server_init("@pktlink.demo", methods)?;
//!
//! // Client side (same loop here, normally another process)
//! let fd = session.client_init("@pktlink.demo", MethodTable::new())?;
//! session.async_send(fd, Packet::create("ping", "", &[])?, |_fd, done| {
//!     println!("{:?}", done);
//! })?;
//! ev.run()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  PacketSession   reassembly, correlation,    │
//! │                  method dispatch             │
//! ├──────────────────────────────────────────────┤
//! │  Connector       handles, CONNECTED /        │
//! │                  DISCONNECTED callbacks      │
//! ├───────────────────────┬──────────────────────┤
//! │  EventLoop (epoll)    │  Transport (AF_UNIX) │
//! └───────────────────────┴──────────────────────┘
//! ```
//!
//! ## Environment
//!
//! - `PKTLINK_LOG_LEVEL` - off/error/warn/info/debug/trace or 0-5
//! - `PKTLINK_FLUSH_LOG` - flush stderr after each log line
//! - `PKTLINK_MAX_EVENTS`, `PKTLINK_LISTEN_BACKLOG`, `PKTLINK_POLL_TIMEOUT_MS`
//! - `PKTLINK_DEBUG` - raise logging to debug when a loop is created

pub use pktlink_core::{
    log, CallbackControl, CallbackId, Handle, Packet, PacketBuilder, PacketError, PacketResult,
    PacketType, PayloadReader, Pid, Transport, Value, COMMAND_LEN, HEADER_SIZE, PACKET_VERSION,
};
pub use pktlink_core::{pk_debug, pk_error, pk_info, pk_trace, pk_warn};

pub use pktlink_runtime::{
    oneshot_send, Completion, ConfigError, Connector, ConnectorEvent, EventCallback, EventLoop,
    MethodTable, PacketSession, Readiness, ReceiveState, RuntimeConfig, SessionError,
    SessionResult, UnixTransport, WatchControl,
};

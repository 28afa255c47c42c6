//! # pktlink-core
//!
//! Core types for the pktlink packet IPC layer.
//!
//! This crate is platform-agnostic and does no I/O. The epoll event loop,
//! the Unix socket transport, the connector and the packet session live in
//! `pktlink-runtime`.
//!
//! ## Modules
//!
//! - `packet` - wire format, builder and reader
//! - `error` - packet error type
//! - `registry` - ordered callback registry tolerant of removal during fan-out
//! - `transport` - socket transport trait
//! - `log` - leveled stderr logging macros
//! - `env` - environment variable helpers

pub mod packet;
pub mod error;
pub mod registry;
pub mod transport;
pub mod log;
pub mod env;

// Re-exports for convenience
pub use packet::{
    Packet, PacketBuilder, PacketType, PayloadReader, Value, COMMAND_LEN, HEADER_SIZE,
    PACKET_VERSION, PAYLOAD_GROWTH,
};
pub use error::{PacketError, PacketResult};
pub use registry::{CallbackControl, CallbackId, Registry};
pub use transport::{Handle, Pid, Transport};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt};

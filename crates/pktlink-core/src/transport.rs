//! Socket transport abstraction.
//!
//! A `Transport` owns the raw socket primitives the connector sits on:
//! create a listening or connected handle for an address, accept, send,
//! and receive while reporting which process sent the bytes.
//!
//! # Implementors
//!
//! - `UnixTransport` (pktlink-runtime, default): `AF_UNIX` stream sockets,
//!   filesystem paths or `@abstract` names, sender pid via `SO_PEERCRED`.
//!
//! Handles are plain integers (file descriptors on Unix). Whether a handle
//! is blocking is decided by the connector, not the transport.

use std::io;

/// Raw connection handle
pub type Handle = i32;

/// Process id of the peer that sent a chunk of bytes
pub type Pid = i32;

/// Socket primitives consumed by the connector and packet session.
///
/// **Contract:**
/// - `create_server` / `create_client` / `accept` return handles in
///   blocking mode; the caller flips them to non-blocking if it wants.
/// - `send` keeps writing until the whole buffer is out, an error occurs,
///   or the socket would block; it returns how much was written.
/// - `recv` returns `Ok((0, _))` only at end of stream.
/// - `destroy` closes the handle; it is called at most once per handle.
pub trait Transport {
    /// Open a listening endpoint at `address`.
    fn create_server(&self, address: &str) -> io::Result<Handle>;

    /// Connect to the endpoint listening at `address`.
    fn create_client(&self, address: &str) -> io::Result<Handle>;

    /// Accept one pending connection on a listening handle.
    fn accept(&self, listener: Handle) -> io::Result<Handle>;

    /// Write `buf`; returns the number of bytes transferred.
    fn send(&self, handle: Handle, buf: &[u8]) -> io::Result<usize>;

    /// Read into `buf`; returns the byte count and the sender's pid.
    fn recv(&self, handle: Handle, buf: &mut [u8]) -> io::Result<(usize, Pid)>;

    /// Close the handle.
    fn destroy(&self, handle: Handle);
}

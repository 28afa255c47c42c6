//! # Packet session - request/ack correlation over a connector
//!
//! Reassembles packets from the byte stream of each watched handle,
//! completes outstanding asynchronous requests when their ACK arrives and
//! dispatches incoming requests to a [`MethodTable`].
//!
//! ## Receive state machine (one context per handle)
//!
//! ```text
//!   Init ──first byte──► Header ──48 bytes, payload > 0──► Body ──► Ready
//!                          └──────48 bytes, payload == 0──────────► Ready
//! ```
//!
//! A context lives until its packet is dispatched or the connection drops.
//! Every read is bounded by the bytes the connector reported available, so
//! a readiness callback never blocks, and several buffered packets are
//! drained in one callback.
//!
//! ## Correlation
//!
//! Requests are keyed by (handle, seq). An ACK removes its request and
//! completes it with [`Completion::Acked`]; a disconnect completes every
//! request on that handle with [`Completion::Cancelled`]. Each completion
//! runs exactly once. No timeout: an unanswered request on a live
//! connection stays pending.
//!
//! One DISCONNECTED hook per session does the cancelling, for every handle
//! the session serves. It is registered by `new` and removed when the last
//! clone drops, so connections accepted before `server_fini` keep it.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use pktlink_core::registry::{CallbackControl, CallbackId};
use pktlink_core::transport::{Pid, Transport};
use pktlink_core::{pk_debug, pk_trace, pk_warn, Packet, PacketType, HEADER_SIZE};

use crate::connector::{Connector, ConnectorEvent, ReadableFn};
use crate::error::{SessionError, SessionResult};

/// Outcome delivered to an `async_send` callback
#[derive(Debug)]
pub enum Completion {
    /// The peer acknowledged; `packet` is the ACK
    Acked { pid: Pid, packet: Packet },
    /// The connection went away before an ACK arrived
    Cancelled,
}

impl Completion {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Completion::Cancelled)
    }

    pub fn packet(&self) -> Option<&Packet> {
        match self {
            Completion::Acked { packet, .. } => Some(packet),
            Completion::Cancelled => None,
        }
    }
}

/// Request handler: `(sender pid, handle, request) -> reply`.
///
/// The reply is sent back only for `REQUEST` packets.
pub type MethodFn = Rc<dyn Fn(Pid, RawFd, &Packet) -> Option<Packet>>;

/// Ordered command → handler table. First match wins.
#[derive(Clone, Default)]
pub struct MethodTable {
    methods: Vec<(String, MethodFn)>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, command: &str, handler: F)
    where
        F: Fn(Pid, RawFd, &Packet) -> Option<Packet> + 'static,
    {
        self.methods.push((command.to_owned(), Rc::new(handler)));
    }

    /// Builder form of [`add`](Self::add).
    pub fn with<F>(mut self, command: &str, handler: F) -> Self
    where
        F: Fn(Pid, RawFd, &Packet) -> Option<Packet> + 'static,
    {
        self.add(command, handler);
        self
    }

    pub fn lookup(&self, command: &str) -> Option<MethodFn> {
        self.methods
            .iter()
            .find(|(name, _)| name == command)
            .map(|(_, handler)| Rc::clone(handler))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for MethodTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.methods.iter().map(|(name, _)| name))
            .finish()
    }
}

/// Receive progress of one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReceiveState {
    #[default]
    Init,
    Header,
    Body,
    Ready,
}

#[derive(Default)]
struct ReceiveContext {
    state: ReceiveState,
    offset: usize,
    pid: Option<Pid>,
    packet: Option<Packet>,
}

type CompletionFn = Box<dyn FnOnce(RawFd, Completion)>;

struct RequestContext {
    handle: RawFd,
    seq: u64,
    packet: Rc<Packet>,
    callback: CompletionFn,
}

struct SessionInner {
    connector: Connector,
    requests: RefCell<Vec<RequestContext>>,
    receivers: RefCell<HashMap<RawFd, ReceiveContext>>,
    hook: Cell<Option<CallbackId>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(id) = self.hook.take() {
            self.connector
                .del_event_callback(ConnectorEvent::Disconnected, id);
        }
    }
}

/// Cloneable session handle; clones share all state.
#[derive(Clone)]
pub struct PacketSession {
    inner: Rc<SessionInner>,
}

/// Largest single read while collecting a one-shot reply payload
const ONESHOT_CHUNK: usize = 64 * 1024;

/// Fill `buf` from `handle`, holding every chunk to one sender pid.
pub(crate) fn read_full(
    transport: &dyn Transport,
    handle: RawFd,
    buf: &mut [u8],
    expected: Option<Pid>,
) -> SessionResult<Pid> {
    let mut filled = 0;
    let mut sender = expected;
    while filled < buf.len() {
        let (n, pid) = transport.recv(handle, &mut buf[filled..])?;
        if n == 0 {
            return Err(SessionError::ShortRead {
                read: filled,
                expected: buf.len(),
            });
        }
        match sender {
            Some(prev) if prev != pid => {
                return Err(SessionError::PidMismatch { expected: prev, got: pid });
            }
            _ => sender = Some(pid),
        }
        filled += n;
    }
    Ok(sender.unwrap_or(-1))
}

fn write_packet(transport: &dyn Transport, handle: RawFd, packet: &Packet) -> SessionResult<()> {
    let bytes = packet.as_bytes();
    let written = transport.send(handle, bytes)?;
    if written != bytes.len() {
        return Err(SessionError::ShortWrite {
            written,
            expected: bytes.len(),
        });
    }
    pk_trace!("session", "fd={} sent {}", handle, packet);
    Ok(())
}

/// Connect to `address`, send `packet`, read one packet back, disconnect.
///
/// Blocks for the whole exchange. The reply is whatever packet the peer
/// writes first.
pub fn oneshot_send(transport: &dyn Transport, address: &str, packet: &Packet) -> SessionResult<Packet> {
    let handle = transport.create_client(address)?;
    let result = oneshot_exchange(transport, handle, packet);
    transport.destroy(handle);
    result
}

fn oneshot_exchange(transport: &dyn Transport, handle: RawFd, packet: &Packet) -> SessionResult<Packet> {
    write_packet(transport, handle, packet)?;

    let mut header = [0u8; HEADER_SIZE];
    let pid = read_full(transport, handle, &mut header, None)?;
    let mut reply = Packet::build(None, 0, &header)?;
    reply.validate_header()?;

    // The announced size is only trusted as far as bytes actually arrive
    let expected = reply.payload_size();
    let mut chunk = vec![0u8; expected.min(ONESHOT_CHUNK)];
    let mut filled = 0;
    while filled < expected {
        let n = (expected - filled).min(chunk.len());
        read_full(transport, handle, &mut chunk[..n], Some(pid)).map_err(|e| match e {
            SessionError::ShortRead { read, .. } => SessionError::ShortRead {
                read: filled + read,
                expected,
            },
            e => e,
        })?;
        reply = Packet::build(Some(reply), HEADER_SIZE + filled, &chunk[..n])?;
        filled += n;
    }
    Ok(reply)
}

impl PacketSession {
    pub fn new(connector: Connector) -> Self {
        let session = Self {
            inner: Rc::new(SessionInner {
                connector,
                requests: RefCell::new(Vec::new()),
                receivers: RefCell::new(HashMap::new()),
                hook: Cell::new(None),
            }),
        };
        session.install_hook();
        session
    }

    pub fn connector(&self) -> &Connector {
        &self.inner.connector
    }

    fn transport(&self) -> Rc<dyn Transport> {
        Rc::clone(self.inner.connector.transport())
    }

    // ── Endpoints ──

    /// Connect to a server and serve `methods` on the new handle.
    pub fn client_init(&self, address: &str, methods: MethodTable) -> SessionResult<RawFd> {
        let readable = self.readable_fn(methods);
        Ok(self.inner.connector.client_create(address, false, readable)?)
    }

    /// Listen on `address`; every accepted connection serves `methods`.
    pub fn server_init(&self, address: &str, methods: MethodTable) -> SessionResult<RawFd> {
        let readable = self.readable_fn(methods);
        Ok(self.inner.connector.server_create(address, false, readable)?)
    }

    /// Run the session over an already connected handle.
    pub fn attach(&self, fd: RawFd, methods: MethodTable) -> SessionResult<()> {
        let readable = self.readable_fn(methods);
        self.inner.connector.adopt(fd, false, readable)?;
        Ok(())
    }

    /// Close a handle from `client_init` or `attach`.
    ///
    /// Requests still pending on it complete with `Cancelled`.
    pub fn client_fini(&self, fd: RawFd) {
        self.inner.connector.client_destroy(fd);
        self.drop_handle_state(fd);
    }

    /// Stop listening. Connections already accepted stay up, and their
    /// requests are still cancelled when they drop.
    pub fn server_fini(&self, fd: RawFd) {
        self.inner.connector.server_destroy(fd);
    }

    fn install_hook(&self) {
        let weak = Rc::downgrade(&self.inner);
        let id = self.inner.connector.add_event_callback(
            ConnectorEvent::Disconnected,
            Box::new(move |handle| match weak.upgrade() {
                Some(inner) => {
                    PacketSession { inner }.drop_handle_state(handle);
                    CallbackControl::Keep
                }
                None => CallbackControl::Remove,
            }),
        );
        self.inner.hook.set(Some(id));
    }

    /// Discard the receive context and cancel every request on `fd`.
    fn drop_handle_state(&self, fd: RawFd) {
        self.inner.receivers.borrow_mut().remove(&fd);

        let cancelled: Vec<RequestContext> = {
            let mut requests = self.inner.requests.borrow_mut();
            let (gone, kept) = std::mem::take(&mut *requests)
                .into_iter()
                .partition(|r| r.handle == fd);
            *requests = kept;
            gone
        };
        if !cancelled.is_empty() {
            pk_debug!("session", "fd={} cancelling {} request(s)", fd, cancelled.len());
        }
        for request in cancelled {
            pk_trace!("session", "fd={} cancel {}", fd, request.packet);
            (request.callback)(fd, Completion::Cancelled);
        }
    }

    // ── Sending ──

    /// Send a request and complete `callback` when its ACK arrives.
    ///
    /// On error the request is forgotten and `callback` never runs.
    pub fn async_send<P, F>(&self, handle: RawFd, packet: P, callback: F) -> SessionResult<()>
    where
        P: Into<Rc<Packet>>,
        F: FnOnce(RawFd, Completion) + 'static,
    {
        let packet: Rc<Packet> = packet.into();
        let seq = packet.seq();
        {
            let mut requests = self.inner.requests.borrow_mut();
            if requests.iter().any(|r| r.handle == handle && r.seq == seq) {
                return Err(SessionError::DuplicateRequest { handle, seq });
            }
            requests.push(RequestContext {
                handle,
                seq,
                packet: Rc::clone(&packet),
                callback: Box::new(callback),
            });
        }

        if let Err(e) = write_packet(&*self.transport(), handle, &packet) {
            self.take_request(handle, seq);
            pk_debug!("session", "fd={} seq={} not sent: {}", handle, seq, e);
            return Err(e);
        }
        Ok(())
    }

    /// Send without tracking a reply.
    pub fn send_only(&self, handle: RawFd, packet: &Packet) -> SessionResult<()> {
        write_packet(&*self.transport(), handle, packet)
    }

    /// [`oneshot_send`] over this session's transport.
    pub fn oneshot_send(&self, address: &str, packet: &Packet) -> SessionResult<Packet> {
        oneshot_send(&*self.transport(), address, packet)
    }

    fn take_request(&self, handle: RawFd, seq: u64) -> Option<RequestContext> {
        let mut requests = self.inner.requests.borrow_mut();
        let pos = requests
            .iter()
            .position(|r| r.handle == handle && r.seq == seq)?;
        Some(requests.remove(pos))
    }

    // ── Introspection ──

    pub fn pending_requests(&self, handle: RawFd) -> usize {
        self.inner
            .requests
            .borrow()
            .iter()
            .filter(|r| r.handle == handle)
            .count()
    }

    pub fn has_receive_context(&self, handle: RawFd) -> bool {
        self.inner.receivers.borrow().contains_key(&handle)
    }

    pub fn receive_state(&self, handle: RawFd) -> Option<ReceiveState> {
        self.inner.receivers.borrow().get(&handle).map(|ctx| ctx.state)
    }

    // ── Receiving ──

    fn readable_fn(&self, methods: MethodTable) -> ReadableFn {
        let weak: Weak<SessionInner> = Rc::downgrade(&self.inner);
        Rc::new(move |fd: RawFd, available: usize| -> io::Result<()> {
            let inner = weak
                .upgrade()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session dropped"))?;
            PacketSession { inner }
                .receive(fd, available, &methods)
                .map_err(|e| {
                    pk_warn!("session", "fd={} receive: {}", fd, e);
                    io::Error::from(e)
                })
        })
    }

    /// Consume up to `available` bytes from `fd`.
    ///
    /// Stops early once a callback has closed or re-watched `fd`.
    fn receive(&self, fd: RawFd, mut available: usize, methods: &MethodTable) -> SessionResult<()> {
        let transport = self.transport();
        let generation = self.inner.connector.event_loop().watch_generation(fd);
        while available > 0 {
            // Out of the map while we work; put back only if unfinished
            let mut ctx = self
                .inner
                .receivers
                .borrow_mut()
                .remove(&fd)
                .unwrap_or_default();
            if ctx.state == ReceiveState::Init {
                ctx.state = ReceiveState::Header;
                ctx.offset = 0;
            }

            let target = match (&ctx.state, &ctx.packet) {
                (ReceiveState::Body, Some(packet)) => packet.total_size(),
                _ => HEADER_SIZE,
            };
            let n = (target - ctx.offset).min(available);
            let mut chunk = vec![0u8; n];
            let pid = read_full(&*transport, fd, &mut chunk, ctx.pid)?;
            available -= n;

            ctx.pid = Some(pid);
            let packet = Packet::build(ctx.packet.take(), ctx.offset, &chunk)?;
            ctx.offset += n;

            if ctx.state == ReceiveState::Header && ctx.offset == HEADER_SIZE {
                packet.validate_header()?;
                ctx.state = if packet.payload_size() == 0 {
                    ReceiveState::Ready
                } else {
                    ReceiveState::Body
                };
            } else if ctx.state == ReceiveState::Body && ctx.offset == packet.total_size() {
                ctx.state = ReceiveState::Ready;
            }

            if ctx.state == ReceiveState::Ready {
                self.dispatch(fd, pid, packet, methods, generation);
                if !self.same_watch(fd, generation) {
                    pk_debug!("session", "fd={} closed during dispatch", fd);
                    return Ok(());
                }
            } else {
                ctx.packet = Some(packet);
                self.inner.receivers.borrow_mut().insert(fd, ctx);
            }
        }
        Ok(())
    }

    fn same_watch(&self, fd: RawFd, generation: Option<u32>) -> bool {
        self.inner.connector.event_loop().watch_generation(fd) == generation
    }

    fn dispatch(
        &self,
        fd: RawFd,
        pid: Pid,
        packet: Packet,
        methods: &MethodTable,
        generation: Option<u32>,
    ) {
        pk_trace!("session", "fd={} pid={} received {}", fd, pid, packet);
        let kind = match packet.packet_type() {
            Some(kind) => kind,
            None => return,
        };

        if kind == PacketType::Ack {
            match self.take_request(fd, packet.seq()) {
                Some(request) => (request.callback)(fd, Completion::Acked { pid, packet }),
                None => pk_warn!("session", "fd={} unmatched ack seq={}", fd, packet.seq()),
            }
            return;
        }

        let handler = match methods.lookup(packet.command()) {
            Some(handler) => handler,
            None => {
                pk_debug!("session", "fd={} no method for {:?}", fd, packet.command());
                return;
            }
        };
        let reply = handler(pid, fd, &packet);
        if !kind.expects_reply() || !self.same_watch(fd, generation) {
            return;
        }
        if let Some(reply) = reply {
            if let Err(e) = write_packet(&*self.transport(), fd, &reply) {
                pk_warn!("session", "fd={} reply to {:?}: {}", fd, packet.command(), e);
            }
        }
    }
}

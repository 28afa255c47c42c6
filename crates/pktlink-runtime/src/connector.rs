//! # Connector - socket lifecycle on top of the event loop
//!
//! Owns raw connection handles, bridges them into an [`EventLoop`] and
//! fans connect/disconnect notifications out to registered callbacks.
//!
//! ```text
//!   listener ready ──► accept ──► watch(client) ──► CONNECTED
//!   client ready ───► FIONREAD ─┬─ n > 0 ──► on_readable(fd, n)
//!                               └─ 0 / error ──► DISCONNECTED ──► Stop
//! ```
//!
//! Handles accepted by a server belong to the connector and are closed
//! after the DISCONNECTED callbacks have run. Handles from `client_create`
//! or `adopt` stay open until `client_destroy`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};

use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};

use pktlink_core::registry::{fan_out, CallbackControl, CallbackId, Registry};
use pktlink_core::transport::Transport;
use pktlink_core::{pk_debug, pk_info, pk_trace, pk_warn};

use crate::config::RuntimeConfig;
use crate::event_loop::{EventLoop, Readiness, WatchControl};
use crate::unix_transport::UnixTransport;

/// Connection lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorEvent {
    Connected,
    Disconnected,
}

/// Connect/disconnect callback. Captured state is the callback's user data.
pub type EventCallbackFn = dyn FnMut(RawFd) -> CallbackControl;

/// Owned event callback, as registered and as handed back on removal
pub type EventCallback = Box<EventCallbackFn>;

/// Called with the handle and the number of bytes ready to read.
/// An `Err` return disconnects the handle.
pub type ReadableFn = Rc<dyn Fn(RawFd, usize) -> io::Result<()>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleKind {
    Listener,
    Accepted,
    Client,
}

struct ConnectorInner {
    ev: EventLoop,
    transport: Rc<dyn Transport>,
    connected: RefCell<Registry<EventCallback>>,
    disconnected: RefCell<Registry<EventCallback>>,
    handles: RefCell<HashMap<RawFd, HandleKind>>,
}

impl Drop for ConnectorInner {
    fn drop(&mut self) {
        for (fd, _) in self.handles.get_mut().drain() {
            self.ev.remove_watch(fd);
            self.transport.destroy(fd);
        }
    }
}

/// Cloneable handle; clones share handles and registries.
#[derive(Clone)]
pub struct Connector {
    inner: Rc<ConnectorInner>,
}

// ── OS helpers ──

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map_err(errno_to_io)?;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL).map_err(errno_to_io)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, nonblocking);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(errno_to_io)?;
    Ok(())
}

/// Bytes buffered for reading on `fd` (`FIONREAD`).
pub(crate) fn available_bytes(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    // SAFETY: FIONREAD writes one c_int through the pointer.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n as *mut libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

fn prepare(fd: RawFd, is_sync: bool) -> io::Result<()> {
    set_cloexec(fd)?;
    set_nonblocking(fd, !is_sync)
}

impl Connector {
    /// Connector over the default Unix transport.
    pub fn new(ev: EventLoop) -> Self {
        Self::with_transport(ev, Rc::new(UnixTransport::new()))
    }

    /// Unix transport tuned by `config` (listen backlog).
    pub fn with_config(ev: EventLoop, config: &RuntimeConfig) -> Self {
        Self::with_transport(ev, Rc::new(UnixTransport::with_config(config)))
    }

    pub fn with_transport(ev: EventLoop, transport: Rc<dyn Transport>) -> Self {
        Self {
            inner: Rc::new(ConnectorInner {
                ev,
                transport,
                connected: RefCell::new(Registry::new()),
                disconnected: RefCell::new(Registry::new()),
                handles: RefCell::new(HashMap::new()),
            }),
        }
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.inner.ev
    }

    pub fn transport(&self) -> &Rc<dyn Transport> {
        &self.inner.transport
    }

    fn downgrade(&self) -> Weak<ConnectorInner> {
        Rc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<ConnectorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn registry(&self, event: ConnectorEvent) -> &RefCell<Registry<EventCallback>> {
        match event {
            ConnectorEvent::Connected => &self.inner.connected,
            ConnectorEvent::Disconnected => &self.inner.disconnected,
        }
    }

    // ── Event callbacks ──

    pub fn add_event_callback(&self, event: ConnectorEvent, callback: EventCallback) -> CallbackId {
        let id = self
            .registry(event)
            .borrow_mut()
            .add(Rc::new(RefCell::new(callback)));
        pk_trace!("connector", "{:?} callback {:?} added", event, id);
        id
    }

    /// Unregister a callback and hand it back.
    ///
    /// Returns `None` for an unknown id, or when the callback is removing
    /// itself while it runs (it is still unregistered).
    pub fn del_event_callback(&self, event: ConnectorEvent, id: CallbackId) -> Option<EventCallback> {
        let entry = self.registry(event).borrow_mut().remove(id)?;
        Rc::try_unwrap(entry).ok().map(RefCell::into_inner)
    }

    pub fn event_callback_count(&self, event: ConnectorEvent) -> usize {
        self.registry(event).borrow().len()
    }

    fn fire(&self, event: ConnectorEvent, fd: RawFd) {
        pk_debug!("connector", "fd={} {:?}", fd, event);
        fan_out(self.registry(event), |cb| cb(fd));
    }

    // ── Handles ──

    /// Open a listening endpoint and accept connections from the loop.
    pub fn server_create(
        &self,
        address: &str,
        is_sync: bool,
        on_readable: ReadableFn,
    ) -> io::Result<RawFd> {
        let transport = Rc::clone(&self.inner.transport);
        let listener = transport.create_server(address)?;
        if let Err(e) = prepare(listener, is_sync) {
            transport.destroy(listener);
            return Err(e);
        }

        let weak = self.downgrade();
        let watch = self.inner.ev.add_watch(
            listener,
            Box::new(move |fd, ready| match Connector::from_weak(&weak) {
                Some(connector) => connector.on_listener_ready(fd, ready, &on_readable),
                None => WatchControl::Stop,
            }),
        );
        if let Err(e) = watch {
            transport.destroy(listener);
            return Err(e);
        }

        self.inner
            .handles
            .borrow_mut()
            .insert(listener, HandleKind::Listener);
        pk_info!("connector", "server fd={} on {}", listener, address);
        Ok(listener)
    }

    /// Connect to `address` and watch the new handle.
    pub fn client_create(
        &self,
        address: &str,
        is_sync: bool,
        on_readable: ReadableFn,
    ) -> io::Result<RawFd> {
        let fd = self.inner.transport.create_client(address)?;
        if let Err(e) = self.attach(fd, is_sync, on_readable, HandleKind::Client) {
            self.inner.transport.destroy(fd);
            return Err(e);
        }
        pk_info!("connector", "client fd={} to {}", fd, address);
        self.fire(ConnectorEvent::Connected, fd);
        Ok(fd)
    }

    /// Take over an already connected handle, like `client_create` would.
    ///
    /// On failure the handle is left open and still belongs to the caller.
    pub fn adopt(&self, fd: RawFd, is_sync: bool, on_readable: ReadableFn) -> io::Result<()> {
        self.attach(fd, is_sync, on_readable, HandleKind::Client)?;
        self.fire(ConnectorEvent::Connected, fd);
        Ok(())
    }

    fn attach(
        &self,
        fd: RawFd,
        is_sync: bool,
        on_readable: ReadableFn,
        kind: HandleKind,
    ) -> io::Result<()> {
        prepare(fd, is_sync)?;
        let weak = self.downgrade();
        self.inner.ev.add_watch(
            fd,
            Box::new(move |fd, ready| match Connector::from_weak(&weak) {
                Some(connector) => connector.on_client_ready(fd, ready, &on_readable),
                None => WatchControl::Stop,
            }),
        )?;
        self.inner.handles.borrow_mut().insert(fd, kind);
        Ok(())
    }

    /// Stop listening and close the listener. Accepted handles stay up.
    pub fn server_destroy(&self, fd: RawFd) {
        self.release(fd);
    }

    /// Stop watching and close a handle. Disconnect callbacks do not fire.
    pub fn client_destroy(&self, fd: RawFd) {
        self.release(fd);
    }

    fn release(&self, fd: RawFd) {
        let known = self.inner.handles.borrow_mut().remove(&fd).is_some();
        self.inner.ev.remove_watch(fd);
        if known {
            self.inner.transport.destroy(fd);
        } else {
            pk_debug!("connector", "fd={} release: unknown handle", fd);
        }
    }

    pub fn is_open(&self, fd: RawFd) -> bool {
        self.inner.handles.borrow().contains_key(&fd)
    }

    pub fn handle_count(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    // ── Readiness ──

    fn on_listener_ready(&self, listener: RawFd, ready: Readiness, on_readable: &ReadableFn) -> WatchControl {
        if ready.error {
            pk_warn!("connector", "listener fd={} error, no longer accepting", listener);
            return WatchControl::Stop;
        }

        let fd = match self.inner.transport.accept(listener) {
            Ok(fd) => fd,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WatchControl::Continue,
            Err(e) => {
                pk_warn!("connector", "listener fd={} accept: {}", listener, e);
                return WatchControl::Continue;
            }
        };

        if let Err(e) = self.attach(fd, false, Rc::clone(on_readable), HandleKind::Accepted) {
            pk_warn!("connector", "fd={} accepted but not watched: {}", fd, e);
            self.inner.transport.destroy(fd);
            return WatchControl::Continue;
        }
        pk_debug!("connector", "listener fd={} accepted fd={}", listener, fd);
        self.fire(ConnectorEvent::Connected, fd);
        WatchControl::Continue
    }

    fn on_client_ready(&self, fd: RawFd, ready: Readiness, on_readable: &ReadableFn) -> WatchControl {
        if ready.error {
            self.disconnect(fd);
            return WatchControl::Stop;
        }
        let available = match available_bytes(fd) {
            Ok(n) => n,
            Err(e) => {
                pk_debug!("connector", "fd={} FIONREAD: {}", fd, e);
                0
            }
        };
        if available == 0 {
            self.disconnect(fd);
            return WatchControl::Stop;
        }
        match on_readable(fd, available) {
            Ok(()) => WatchControl::Continue,
            Err(e) => {
                pk_debug!("connector", "fd={} dropped: {}", fd, e);
                self.disconnect(fd);
                WatchControl::Stop
            }
        }
    }

    fn disconnect(&self, fd: RawFd) {
        self.inner.ev.remove_watch(fd);
        self.fire(ConnectorEvent::Disconnected, fd);

        let accepted = {
            let mut handles = self.inner.handles.borrow_mut();
            match handles.get(&fd) {
                Some(HandleKind::Accepted) => handles.remove(&fd).is_some(),
                _ => false,
            }
        };
        if accepted {
            self.inner.transport.destroy(fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    fn temp_path() -> String {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("pktlink-conn-{}-{}.sock", std::process::id(), n))
            .to_string_lossy()
            .into_owned()
    }

    fn connector() -> Connector {
        Connector::new(EventLoop::with_config(&RuntimeConfig::new()).unwrap())
    }

    fn drain() -> ReadableFn {
        Rc::new(|fd: RawFd, n: usize| -> io::Result<()> {
            let mut buf = vec![0u8; n];
            // SAFETY: buf holds n bytes.
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, n) };
            Ok(())
        })
    }

    fn write_bytes(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn tick(c: &Connector) {
        c.event_loop().run_once(Some(Duration::from_millis(500))).unwrap();
    }

    #[test]
    fn test_available_bytes() {
        let (a, b) = UnixTransport::socketpair().unwrap();
        assert_eq!(available_bytes(a).unwrap(), 0);
        write_bytes(b, b"12345");
        assert_eq!(available_bytes(a).unwrap(), 5);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_nonblocking_toggle() {
        let (a, b) = UnixTransport::socketpair().unwrap();
        set_nonblocking(a, true).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(a, FcntlArg::F_GETFL).unwrap());
        assert!(flags.contains(OFlag::O_NONBLOCK));
        set_nonblocking(a, false).unwrap();
        let flags = OFlag::from_bits_truncate(fcntl(a, FcntlArg::F_GETFL).unwrap());
        assert!(!flags.contains(OFlag::O_NONBLOCK));
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_adopt_reads_and_disconnects() {
        let c = connector();
        let (a, b) = UnixTransport::socketpair().unwrap();

        let connected = Rc::new(Cell::new(0));
        let disconnected = Rc::new(Cell::new(0));
        let c1 = Rc::clone(&connected);
        c.add_event_callback(
            ConnectorEvent::Connected,
            Box::new(move |_| {
                c1.set(c1.get() + 1);
                CallbackControl::Keep
            }),
        );
        let d1 = Rc::clone(&disconnected);
        c.add_event_callback(
            ConnectorEvent::Disconnected,
            Box::new(move |fd| {
                assert_eq!(fd, a);
                d1.set(d1.get() + 1);
                CallbackControl::Keep
            }),
        );

        let seen = Rc::new(Cell::new(0usize));
        let seen2 = Rc::clone(&seen);
        let inner = drain();
        c.adopt(
            a,
            false,
            Rc::new(move |fd: RawFd, n: usize| -> io::Result<()> {
                seen2.set(seen2.get() + n);
                inner(fd, n)
            }),
        )
        .unwrap();
        assert_eq!(connected.get(), 1);

        write_bytes(b, b"abc");
        tick(&c);
        assert_eq!(seen.get(), 3);
        assert_eq!(disconnected.get(), 0);

        unsafe { libc::close(b) };
        tick(&c);
        assert_eq!(disconnected.get(), 1);
        assert!(!c.event_loop().is_watched(a));
        // Adopted handles stay open until client_destroy
        assert!(c.is_open(a));
        c.client_destroy(a);
        assert!(!c.is_open(a));
    }

    #[test]
    fn test_readable_error_disconnects() {
        let c = connector();
        let (a, b) = UnixTransport::socketpair().unwrap();
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        c.add_event_callback(
            ConnectorEvent::Disconnected,
            Box::new(move |_| {
                hit2.set(true);
                CallbackControl::Remove
            }),
        );
        c.adopt(
            a,
            false,
            Rc::new(|_: RawFd, _: usize| -> io::Result<()> {
                Err(io::Error::new(io::ErrorKind::InvalidData, "bad"))
            }),
        )
        .unwrap();
        write_bytes(b, b"x");
        tick(&c);
        assert!(hit.get());
        assert_eq!(c.event_callback_count(ConnectorEvent::Disconnected), 0);
        c.client_destroy(a);
        unsafe { libc::close(b) };
    }

    #[test]
    fn test_del_event_callback_returns_callback() {
        let c = connector();
        let id = c.add_event_callback(ConnectorEvent::Connected, Box::new(|_| CallbackControl::Keep));
        assert_eq!(c.event_callback_count(ConnectorEvent::Connected), 1);
        let mut cb = c.del_event_callback(ConnectorEvent::Connected, id).unwrap();
        assert_eq!(cb(3), CallbackControl::Keep);
        assert!(c.del_event_callback(ConnectorEvent::Connected, id).is_none());
        assert!(c.del_event_callback(ConnectorEvent::Disconnected, id).is_none());
    }

    #[test]
    fn test_server_accepts_and_closes_accepted() {
        let c = connector();
        let path = temp_path();
        let listener = c.server_create(&path, false, drain()).unwrap();
        assert!(c.is_open(listener));

        let accepted = Rc::new(Cell::new(-1));
        let acc2 = Rc::clone(&accepted);
        c.add_event_callback(
            ConnectorEvent::Connected,
            Box::new(move |fd| {
                acc2.set(fd);
                CallbackControl::Keep
            }),
        );

        let t = UnixTransport::new();
        let client = t.create_client(&path).unwrap();
        tick(&c);
        let server_side = accepted.get();
        assert!(server_side >= 0);
        assert!(c.is_open(server_side));

        t.destroy(client);
        tick(&c);
        assert!(!c.is_open(server_side));

        c.server_destroy(listener);
        assert_eq!(c.handle_count(), 0);
        let _ = std::fs::remove_file(&path);
    }

    fn is_nonblocking(fd: RawFd) -> bool {
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).unwrap());
        flags.contains(OFlag::O_NONBLOCK)
    }

    #[test]
    fn test_sync_server_stays_blocking() {
        let c = connector();
        let path = temp_path();
        let listener = c.server_create(&path, true, drain()).unwrap();
        assert!(!is_nonblocking(listener));
        c.server_destroy(listener);

        let listener = c.server_create(&path, false, drain()).unwrap();
        assert!(is_nonblocking(listener));
        c.server_destroy(listener);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_client_create_mode_and_connected() {
        let c = connector();
        let path = temp_path();
        let listener = c.server_create(&path, false, drain()).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen2 = Rc::clone(&seen);
        c.add_event_callback(
            ConnectorEvent::Connected,
            Box::new(move |fd| {
                seen2.borrow_mut().push(fd);
                CallbackControl::Keep
            }),
        );

        let sync_client = c.client_create(&path, true, drain()).unwrap();
        assert!(!is_nonblocking(sync_client));
        assert_eq!(seen.borrow().as_slice(), &[sync_client]);

        let async_client = c.client_create(&path, false, drain()).unwrap();
        assert!(is_nonblocking(async_client));
        assert_eq!(seen.borrow().as_slice(), &[sync_client, async_client]);
        assert!(c.event_loop().is_watched(sync_client));
        assert!(c.event_loop().is_watched(async_client));

        c.client_destroy(sync_client);
        c.client_destroy(async_client);
        c.server_destroy(listener);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_with_config_listens() {
        let config = RuntimeConfig::new().listen_backlog(1);
        let c = Connector::with_config(
            EventLoop::with_config(&config).unwrap(),
            &config,
        );
        let path = temp_path();
        let listener = c.server_create(&path, false, drain()).unwrap();

        let t = UnixTransport::with_config(&config);
        let client = t.create_client(&path).unwrap();
        tick(&c);
        assert_eq!(c.handle_count(), 2);

        t.destroy(client);
        tick(&c);
        assert_eq!(c.handle_count(), 1);
        c.server_destroy(listener);
        let _ = std::fs::remove_file(&path);
    }
}

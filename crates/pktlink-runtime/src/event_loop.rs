//! # Event loop - single-threaded epoll readiness dispatcher
//!
//! Handles are watched for read readiness (error and hang-up are always
//! reported by epoll). Each watch owns a callback; the callback answers
//! `WatchControl::Stop` to be unregistered.
//!
//! The loop is level-triggered. A callback that leaves bytes unread is
//! called again on the next `run_once`.
//!
//! ```ignore
//! let ev = EventLoop::new()?;
//! ev.add_watch(fd, Box::new(|fd, ready| {
//!     if ready.error { return WatchControl::Stop; }
//!     WatchControl::Continue
//! }))?;
//! ev.run()?;
//! ```
//!
//! No borrow of the loop state is held while a callback runs, so callbacks
//! may add or remove watches (their own included). Calling `run_once` from
//! inside a callback is not supported.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use pktlink_core::{pk_debug, pk_trace};

use crate::config::RuntimeConfig;

/// Readiness reported for one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    fn from_flags(flags: EpollFlags) -> Self {
        Self {
            readable: flags.contains(EpollFlags::EPOLLIN),
            error: flags.contains(EpollFlags::EPOLLERR),
            hangup: flags.intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLRDHUP),
        }
    }
}

/// Callback verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchControl {
    /// Keep watching
    Continue,
    /// Unregister the watch
    Stop,
}

/// Readiness callback bound to one handle
pub type WatchFn = dyn FnMut(RawFd, Readiness) -> WatchControl;

struct Watch {
    generation: u32,
    callback: Rc<RefCell<Box<WatchFn>>>,
}

struct LoopInner {
    epoll: Epoll,
    watches: HashMap<RawFd, Watch>,
    next_generation: u32,
    quit: bool,
    max_events: usize,
    poll_timeout: Duration,
}

/// epoll data word: generation in the high half, fd in the low half.
/// Events queued for a handle that was unwatched and re-watched within
/// the same batch are dropped by the generation check.
#[inline]
fn encode_token(fd: RawFd, generation: u32) -> u64 {
    ((generation as u64) << 32) | (fd as u32 as u64)
}

#[inline]
fn decode_token(token: u64) -> (RawFd, u32) {
    ((token & 0xFFFF_FFFF) as u32 as RawFd, (token >> 32) as u32)
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

/// Cloneable handle to one loop. All clones share the same state.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl EventLoop {
    /// Create a loop configured from the environment.
    pub fn new() -> io::Result<Self> {
        Self::with_config(&RuntimeConfig::from_env())
    }

    pub fn with_config(config: &RuntimeConfig) -> io::Result<Self> {
        config
            .validate()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        config.apply_logging();

        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(errno_to_io)?;
        Ok(Self {
            inner: Rc::new(RefCell::new(LoopInner {
                epoll,
                watches: HashMap::new(),
                next_generation: 1,
                quit: false,
                max_events: config.max_events,
                poll_timeout: config.poll_timeout,
            })),
        })
    }

    /// Watch `fd` for readability, error and hang-up.
    pub fn add_watch(&self, fd: RawFd, callback: Box<WatchFn>) -> io::Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.watches.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("fd {} already watched", fd),
            ));
        }
        let generation = inner.next_generation;
        inner.next_generation = inner.next_generation.wrapping_add(1).max(1);

        let event = EpollEvent::new(EpollFlags::EPOLLIN, encode_token(fd, generation));
        // SAFETY: the caller keeps `fd` open until the watch is removed.
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        inner.epoll.add(borrowed, event).map_err(errno_to_io)?;

        inner.watches.insert(
            fd,
            Watch {
                generation,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        pk_trace!("event_loop", "fd={} watched gen={}", fd, generation);
        Ok(())
    }

    /// Stop watching `fd`. Returns false if it was not watched.
    ///
    /// Must be called before the handle is closed.
    pub fn remove_watch(&self, fd: RawFd) -> bool {
        let mut inner = self.inner.borrow_mut();
        if inner.watches.remove(&fd).is_none() {
            return false;
        }
        // SAFETY: the handle is still open (see above).
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        if let Err(e) = inner.epoll.delete(borrowed) {
            pk_debug!("event_loop", "fd={} epoll delete: {}", fd, e);
        }
        pk_trace!("event_loop", "fd={} unwatched", fd);
        true
    }

    fn remove_if_generation(&self, fd: RawFd, generation: u32) {
        if self.watch_generation(fd) == Some(generation) {
            self.remove_watch(fd);
        }
    }

    /// Generation of the current watch on `fd`; changes whenever the fd is
    /// unwatched and watched again.
    pub fn watch_generation(&self, fd: RawFd) -> Option<u32> {
        self.inner.borrow().watches.get(&fd).map(|w| w.generation)
    }

    pub fn is_watched(&self, fd: RawFd) -> bool {
        self.inner.borrow().watches.contains_key(&fd)
    }

    pub fn watch_count(&self) -> usize {
        self.inner.borrow().watches.len()
    }

    /// Wait once and dispatch every ready handle.
    ///
    /// `None` blocks until something is ready. Returns the number of
    /// callbacks invoked; an interrupted wait counts as zero.
    pub fn run_once(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            Some(d) => EpollTimeout::from(d.as_millis().min(u16::MAX as u128) as u16),
        };

        let ready: Vec<(u64, EpollFlags)> = {
            let inner = self.inner.borrow();
            let mut events = vec![EpollEvent::empty(); inner.max_events];
            let n = match inner.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(nix::errno::Errno::EINTR) => return Ok(0),
                Err(e) => return Err(errno_to_io(e)),
            };
            events[..n].iter().map(|ev| (ev.data(), ev.events())).collect()
        };

        let mut dispatched = 0;
        for (token, flags) in ready {
            let (fd, generation) = decode_token(token);
            let callback = {
                let inner = self.inner.borrow();
                match inner.watches.get(&fd) {
                    Some(w) if w.generation == generation => Rc::clone(&w.callback),
                    _ => continue,
                }
            };

            let readiness = Readiness::from_flags(flags);
            pk_trace!("event_loop", "fd={} ready {:?}", fd, readiness);
            let control = {
                let mut cb = callback.borrow_mut();
                (*cb)(fd, readiness)
            };
            dispatched += 1;

            if control == WatchControl::Stop {
                self.remove_if_generation(fd, generation);
            }
        }
        Ok(dispatched)
    }

    /// Dispatch until `quit()` is called or no watches remain.
    pub fn run(&self) -> io::Result<()> {
        self.inner.borrow_mut().quit = false;
        loop {
            let (quit, empty, slice) = {
                let inner = self.inner.borrow();
                (inner.quit, inner.watches.is_empty(), inner.poll_timeout)
            };
            if quit || empty {
                return Ok(());
            }
            self.run_once(Some(slice))?;
        }
    }

    /// Ask `run()` to return after the current dispatch round.
    pub fn quit(&self) {
        self.inner.borrow_mut().quit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn write_bytes(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn test_loop() -> EventLoop {
        EventLoop::with_config(&RuntimeConfig::new()).unwrap()
    }

    #[test]
    fn test_token_round_trip() {
        assert_eq!(decode_token(encode_token(7, 3)), (7, 3));
        assert_eq!(decode_token(encode_token(0, u32::MAX)), (0, u32::MAX));
    }

    #[test]
    fn test_readable_dispatch() {
        let ev = test_loop();
        let (a, b) = socketpair();
        let hits = Rc::new(Cell::new(0));

        let hits2 = Rc::clone(&hits);
        ev.add_watch(a, Box::new(move |fd, ready| {
            assert!(ready.readable);
            let mut buf = [0u8; 16];
            unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            hits2.set(hits2.get() + 1);
            WatchControl::Continue
        }))
        .unwrap();

        assert_eq!(ev.run_once(Some(Duration::from_millis(10))).unwrap(), 0);
        write_bytes(b, b"hi");
        assert_eq!(ev.run_once(Some(Duration::from_millis(1000))).unwrap(), 1);
        assert_eq!(hits.get(), 1);
        assert!(ev.is_watched(a));

        assert!(ev.remove_watch(a));
        assert!(!ev.remove_watch(a));
        close(a);
        close(b);
    }

    #[test]
    fn test_watch_generation_changes_on_rewatch() {
        let ev = test_loop();
        let (a, b) = socketpair();
        assert_eq!(ev.watch_generation(a), None);

        ev.add_watch(a, Box::new(|_, _| WatchControl::Continue)).unwrap();
        let first = ev.watch_generation(a).unwrap();
        assert!(ev.remove_watch(a));
        assert_eq!(ev.watch_generation(a), None);

        ev.add_watch(a, Box::new(|_, _| WatchControl::Continue)).unwrap();
        assert_ne!(ev.watch_generation(a), Some(first));
        ev.remove_watch(a);
        close(a);
        close(b);
    }

    #[test]
    fn test_stop_unregisters() {
        let ev = test_loop();
        let (a, b) = socketpair();
        ev.add_watch(a, Box::new(|_, _| WatchControl::Stop)).unwrap();
        assert!(ev.add_watch(a, Box::new(|_, _| WatchControl::Stop)).is_err());

        write_bytes(b, b"x");
        assert_eq!(ev.run_once(Some(Duration::from_millis(1000))).unwrap(), 1);
        assert!(!ev.is_watched(a));
        assert_eq!(ev.watch_count(), 0);
        close(a);
        close(b);
    }

    #[test]
    fn test_hangup_reported() {
        let ev = test_loop();
        let (a, b) = socketpair();
        let seen = Rc::new(Cell::new(Readiness::default()));
        let seen2 = Rc::clone(&seen);
        ev.add_watch(a, Box::new(move |_, ready| {
            seen2.set(ready);
            WatchControl::Stop
        }))
        .unwrap();

        close(b);
        ev.run_once(Some(Duration::from_millis(1000))).unwrap();
        assert!(seen.get().hangup);
        close(a);
    }

    #[test]
    fn test_run_until_quit() {
        let ev = test_loop();
        let (a, b) = socketpair();
        let ev2 = ev.clone();
        ev.add_watch(a, Box::new(move |_, _| {
            ev2.quit();
            WatchControl::Continue
        }))
        .unwrap();

        write_bytes(b, b"q");
        ev.run().unwrap();
        assert!(ev.is_watched(a));
        ev.remove_watch(a);
        close(a);
        close(b);
    }
}

//! `UnixTransport` - default `Transport` implementation.
//!
//! `AF_UNIX` stream sockets. Addresses are filesystem paths, or Linux
//! abstract-namespace names written with a leading `@` (`@pktlink.echo`).
//! A stale socket file at a server path is unlinked before bind; any other
//! kind of file there is left alone and bind fails.
//!
//! The sender pid reported by `recv` is the connected peer's pid from
//! `SO_PEERCRED` (`-1` where the platform has no equivalent).

use std::io;
use std::mem;
use std::os::unix::fs::FileTypeExt;

use pktlink_core::pk_debug;
use pktlink_core::transport::{Handle, Pid, Transport};

use crate::config::{defaults, RuntimeConfig};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const SOCK_FLAGS: libc::c_int = libc::SOCK_CLOEXEC;
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        const SOCK_FLAGS: libc::c_int = 0;
        const SEND_FLAGS: libc::c_int = 0;
    }
}

#[inline]
fn last_error() -> io::Error {
    io::Error::last_os_error()
}

/// Encode `address` as a `sockaddr_un` and its effective length.
fn sockaddr_for(address: &str) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let base = mem::offset_of!(libc::sockaddr_un, sun_path);

    let (bytes, abstract_ns) = match address.strip_prefix('@') {
        Some(name) => (name.as_bytes(), true),
        None => (address.as_bytes(), false),
    };
    if bytes.is_empty() || bytes.contains(&0) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid socket address {:?}", address),
        ));
    }
    if abstract_ns && !cfg!(any(target_os = "linux", target_os = "android")) {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "abstract socket names need Linux",
        ));
    }

    // Abstract names start after a leading NUL; paths need a trailing one.
    let start = usize::from(abstract_ns);
    if start + bytes.len() + 1 > addr.sun_path.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("socket address too long: {} bytes", bytes.len()),
        ));
    }
    for (dst, src) in addr.sun_path[start..].iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = if abstract_ns {
        base + 1 + bytes.len()
    } else {
        base + bytes.len() + 1
    };
    Ok((addr, len as libc::socklen_t))
}

fn new_socket() -> io::Result<Handle> {
    // SAFETY: plain syscall, no pointers.
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | SOCK_FLAGS, 0) };
    if fd < 0 {
        return Err(last_error());
    }
    Ok(fd)
}

fn close_quiet(fd: Handle) {
    // SAFETY: fd was returned by socket/accept and is closed exactly once.
    unsafe { libc::close(fd) };
}

/// Remove a leftover socket file from a previous server at `path`.
fn unlink_stale(path: &str) -> io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => std::fs::remove_file(path),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Pid of the process on the other end of a connected socket.
fn peer_pid(fd: Handle) -> Pid {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            // SAFETY: ucred is plain old data and `len` matches its size.
            unsafe {
                let mut cred: libc::ucred = mem::zeroed();
                let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
                let ret = libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_PEERCRED,
                    &mut cred as *mut libc::ucred as *mut libc::c_void,
                    &mut len,
                );
                if ret == 0 { cred.pid } else { -1 }
            }
        } else {
            let _ = fd;
            -1
        }
    }
}

/// Unix domain socket transport
#[derive(Debug, Clone)]
pub struct UnixTransport {
    backlog: i32,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self {
            backlog: defaults::LISTEN_BACKLOG,
        }
    }

    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            backlog: config.listen_backlog,
        }
    }

    /// `listen(2)` backlog used by `create_server`
    pub fn backlog(&self) -> i32 {
        self.backlog
    }

    /// A connected pair of anonymous sockets.
    pub fn socketpair() -> io::Result<(Handle, Handle)> {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` has room for the two descriptors.
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM | SOCK_FLAGS, 0, fds.as_mut_ptr())
        };
        if ret != 0 {
            return Err(last_error());
        }
        Ok((fds[0], fds[1]))
    }
}

impl Default for UnixTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UnixTransport {
    fn create_server(&self, address: &str) -> io::Result<Handle> {
        let (addr, len) = sockaddr_for(address)?;
        if !address.starts_with('@') {
            unlink_stale(address)?;
        }

        let fd = new_socket()?;
        // SAFETY: addr/len come from sockaddr_for.
        let ret = unsafe {
            libc::bind(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len)
        };
        if ret != 0 {
            let err = last_error();
            close_quiet(fd);
            return Err(err);
        }
        // SAFETY: plain syscall.
        if unsafe { libc::listen(fd, self.backlog) } != 0 {
            let err = last_error();
            close_quiet(fd);
            return Err(err);
        }
        pk_debug!("transport", "fd={} listening on {}", fd, address);
        Ok(fd)
    }

    fn create_client(&self, address: &str) -> io::Result<Handle> {
        let (addr, len) = sockaddr_for(address)?;
        let fd = new_socket()?;
        loop {
            // SAFETY: addr/len come from sockaddr_for.
            let ret = unsafe {
                libc::connect(fd, &addr as *const libc::sockaddr_un as *const libc::sockaddr, len)
            };
            if ret == 0 {
                break;
            }
            let err = last_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            close_quiet(fd);
            return Err(err);
        }
        pk_debug!("transport", "fd={} connected to {}", fd, address);
        Ok(fd)
    }

    fn accept(&self, listener: Handle) -> io::Result<Handle> {
        loop {
            // SAFETY: null address pointers are allowed by accept(2).
            let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
            if fd >= 0 {
                return Ok(fd);
            }
            let err = last_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn send(&self, handle: Handle, buf: &[u8]) -> io::Result<usize> {
        let mut sent = 0;
        while sent < buf.len() {
            let rest = &buf[sent..];
            // SAFETY: `rest` is a valid readable slice.
            let n = unsafe {
                libc::send(handle, rest.as_ptr() as *const libc::c_void, rest.len(), SEND_FLAGS)
            };
            if n < 0 {
                let err = last_error();
                match err.kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock if sent > 0 => break,
                    _ => return Err(err),
                }
            }
            if n == 0 {
                break;
            }
            sent += n as usize;
        }
        Ok(sent)
    }

    fn recv(&self, handle: Handle, buf: &mut [u8]) -> io::Result<(usize, Pid)> {
        loop {
            // SAFETY: `buf` is a valid writable slice.
            let n = unsafe {
                libc::recv(handle, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n >= 0 {
                return Ok((n as usize, peer_pid(handle)));
            }
            let err = last_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }

    fn destroy(&self, handle: Handle) {
        pk_debug!("transport", "fd={} closed", handle);
        close_quiet(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT: AtomicUsize = AtomicUsize::new(0);

    fn temp_path() -> String {
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir()
            .join(format!("pktlink-ut-{}-{}.sock", std::process::id(), n))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn test_sockaddr_validation() {
        assert!(sockaddr_for("").is_err());
        assert!(sockaddr_for("@").is_err());
        assert!(sockaddr_for("a\0b").is_err());
        assert!(sockaddr_for(&"x".repeat(200)).is_err());

        let (addr, len) = sockaddr_for("/tmp/a").unwrap();
        let base = mem::offset_of!(libc::sockaddr_un, sun_path);
        assert_eq!(len as usize, base + 7);
        assert_eq!(addr.sun_path[0] as u8, b'/');
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_abstract_address() {
        let (addr, len) = sockaddr_for("@pktlink").unwrap();
        let base = mem::offset_of!(libc::sockaddr_un, sun_path);
        assert_eq!(addr.sun_path[0], 0);
        assert_eq!(addr.sun_path[1] as u8, b'p');
        assert_eq!(len as usize, base + 1 + 7);
    }

    #[test]
    fn test_server_client_exchange() {
        let t = UnixTransport::new();
        let path = temp_path();
        let listener = t.create_server(&path).unwrap();
        let client = t.create_client(&path).unwrap();
        let server_side = t.accept(listener).unwrap();

        assert_eq!(t.send(client, b"hello").unwrap(), 5);
        let mut buf = [0u8; 5];
        let (n, pid) = t.recv(server_side, &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
        #[cfg(target_os = "linux")]
        assert_eq!(pid, std::process::id() as Pid);
        let _ = pid;

        t.destroy(client);
        let (n, _) = t.recv(server_side, &mut buf).unwrap();
        assert_eq!(n, 0);

        t.destroy(server_side);
        t.destroy(listener);
        // Stale socket file is replaced on the next bind
        let again = t.create_server(&path).unwrap();
        t.destroy(again);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_refuses_to_unlink_regular_file() {
        let t = UnixTransport::new();
        let path = temp_path();
        std::fs::write(&path, b"not a socket").unwrap();
        let err = t.create_server(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_connect_missing_server() {
        let t = UnixTransport::new();
        assert!(t.create_client(&temp_path()).is_err());
    }

    #[test]
    fn test_backlog_from_config() {
        assert_eq!(UnixTransport::new().backlog(), defaults::LISTEN_BACKLOG);
        let t = UnixTransport::with_config(&RuntimeConfig::new().listen_backlog(7));
        assert_eq!(t.backlog(), 7);
    }
}

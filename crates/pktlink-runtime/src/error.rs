//! Packet session errors

use std::fmt;
use std::io;
use std::os::fd::RawFd;

use pktlink_core::{PacketError, Pid};

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug)]
pub enum SessionError {
    /// A request with this (handle, seq) is already in flight
    DuplicateRequest { handle: RawFd, seq: u64 },

    /// The transport took fewer bytes than the packet holds
    ShortWrite { written: usize, expected: usize },

    /// The stream ended before a full packet arrived
    ShortRead { read: usize, expected: usize },

    /// Bytes of one packet came from different processes
    PidMismatch { expected: Pid, got: Pid },

    Io(io::Error),

    Packet(PacketError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::DuplicateRequest { handle, seq } => {
                write!(f, "request seq={} already pending on fd={}", seq, handle)
            }
            SessionError::ShortWrite { written, expected } => {
                write!(f, "short write: {}/{} bytes", written, expected)
            }
            SessionError::ShortRead { read, expected } => {
                write!(f, "short read: {}/{} bytes", read, expected)
            }
            SessionError::PidMismatch { expected, got } => {
                write!(f, "sender pid changed mid-packet: {} -> {}", expected, got)
            }
            SessionError::Io(e) => write!(f, "I/O error: {}", e),
            SessionError::Packet(e) => write!(f, "packet error: {}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(e) => Some(e),
            SessionError::Packet(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Io(e)
    }
}

impl From<PacketError> for SessionError {
    fn from(e: PacketError) -> Self {
        SessionError::Packet(e)
    }
}

impl From<SessionError> for io::Error {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::Io(e) => e,
            SessionError::ShortRead { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            SessionError::ShortWrite { .. } => io::Error::new(io::ErrorKind::WriteZero, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_conversion() {
        let e = SessionError::PidMismatch { expected: 10, got: 11 };
        assert_eq!(e.to_string(), "sender pid changed mid-packet: 10 -> 11");

        let io_err: io::Error = SessionError::ShortRead { read: 3, expected: 48 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::UnexpectedEof);

        let e: SessionError = PacketError::Truncated.into();
        assert!(matches!(e, SessionError::Packet(PacketError::Truncated)));
    }
}

//! Error types for packet construction and decoding

use core::fmt;

/// Result type for packet operations
pub type PacketResult<T> = Result<T, PacketError>;

/// Errors raised while packing, unpacking or reassembling a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Command name does not fit the fixed header field (length given)
    CommandTooLong(usize),

    /// Command name contains a NUL byte
    InvalidCommand,

    /// Format string carries a tag that is not one of `iIsSdD`
    UnknownTag(char),

    /// Format tags and supplied values disagree (position of first mismatch)
    FormatMismatch(usize),

    /// String value contains an interior NUL and cannot be NUL-terminated
    InteriorNul,

    /// Ran off the end of the payload while unpacking
    Truncated,

    /// String field is not valid UTF-8
    InvalidUtf8,

    /// Append offset is not contiguous with the bytes already assembled
    InvalidOffset { offset: usize, len: usize },

    /// Header carries a protocol version this build does not speak
    UnsupportedVersion(i32),

    /// Header carries a negative or oversized payload length
    InvalidPayloadSize(i32),

    /// Header carries an unknown type tag
    UnknownType(i32),

    /// Assembled payload does not fit the 32-bit size field (length given)
    PayloadTooLarge(usize),

    /// Header accessors used before the header bytes were all assembled
    IncompleteHeader,
}

impl fmt::Display for PacketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketError::CommandTooLong(len) => write!(f, "command too long: {} bytes", len),
            PacketError::InvalidCommand => write!(f, "command contains NUL"),
            PacketError::UnknownTag(tag) => write!(f, "unknown format tag '{}'", tag),
            PacketError::FormatMismatch(pos) => {
                write!(f, "format does not match values at position {}", pos)
            }
            PacketError::InteriorNul => write!(f, "string contains interior NUL"),
            PacketError::Truncated => write!(f, "payload truncated"),
            PacketError::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            PacketError::InvalidOffset { offset, len } => {
                write!(f, "invalid append offset {} (assembled {})", offset, len)
            }
            PacketError::UnsupportedVersion(v) => write!(f, "unsupported packet version {}", v),
            PacketError::InvalidPayloadSize(sz) => write!(f, "invalid payload size {}", sz),
            PacketError::UnknownType(t) => write!(f, "unknown packet type {}", t),
            PacketError::PayloadTooLarge(len) => write!(f, "payload too large: {} bytes", len),
            PacketError::IncompleteHeader => write!(f, "packet header incomplete"),
        }
    }
}

impl std::error::Error for PacketError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = PacketError::UnknownTag('x');
        assert_eq!(format!("{}", e), "unknown format tag 'x'");

        let e = PacketError::InvalidOffset { offset: 10, len: 4 };
        assert_eq!(format!("{}", e), "invalid append offset 10 (assembled 4)");
    }
}

//! Error types for the reactor and the WebSocket codec.

use std::fmt;
use std::io;

/// Result type alias for reactor and WebSocket operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type.
#[derive(Debug)]
pub enum Error {
    /// A bounded poll hit its deadline without any ready event.
    Timeout,
    /// The poller or stream has been shut down.
    Closed,
    /// Peer closed the connection, or the close handshake fully completed.
    Eof,
    /// Raw kernel failure surfaced unchanged.
    Io(io::Error),
    /// The URL handed to the handshake has a scheme other than `ws`/`wss`.
    InvalidAddress,
    /// A control frame violated RFC 6455 (fragmented, or payload > 125).
    InvalidControlFrame,
    /// The HTTP upgrade was refused or the accept key did not match.
    HandshakeFailed(&'static str),
    /// A frame opcode violated the fragmentation rules.
    UnexpectedOpcode,
    /// A frame declared a payload above the configured limit.
    PayloadTooLarge,
    /// Generic protocol violation in the frame layer.
    Protocol(&'static str),
    /// Malformed HTTP in the upgrade exchange.
    InvalidHttp(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::Closed => write!(f, "closed"),
            Error::Eof => write!(f, "end of stream"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::InvalidAddress => write!(f, "invalid address"),
            Error::InvalidControlFrame => write!(f, "invalid control frame"),
            Error::HandshakeFailed(msg) => write!(f, "handshake failed: {}", msg),
            Error::UnexpectedOpcode => write!(f, "unexpected opcode"),
            Error::PayloadTooLarge => write!(f, "payload too large"),
            Error::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Error::InvalidHttp(msg) => write!(f, "invalid HTTP: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof => Error::Eof,
            io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(e),
        }
    }
}

impl Error {
    /// Error carrying the current `errno` value.
    pub(crate) fn last_os_error() -> Self {
        Error::Io(io::Error::last_os_error())
    }

    /// True for errors that end the stream for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Error::Timeout)
    }
}

/// WebSocket close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Normal = 1000,
    /// Endpoint is going away (e.g. server shutdown).
    GoingAway = 1001,
    /// Protocol error.
    ProtocolError = 1002,
    /// Received a data type it cannot accept.
    UnknownData = 1003,
    /// Payload inconsistent with the message type (e.g. bad UTF-8).
    BadPayload = 1007,
    /// Message violates endpoint policy.
    PolicyError = 1008,
    /// Message too big to process.
    TooBig = 1009,
    /// Client expected the server to negotiate an extension.
    NeedsExtension = 1010,
    /// Server encountered an unexpected condition.
    InternalError = 1011,
    /// Service is restarting.
    ServiceRestart = 1012,
    /// Try again later (e.g. overload).
    TryAgainLater = 1013,
    /// TLS handshake failure (never sent on the wire).
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Parse a wire status code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::Normal),
            1001 => Some(CloseCode::GoingAway),
            1002 => Some(CloseCode::ProtocolError),
            1003 => Some(CloseCode::UnknownData),
            1007 => Some(CloseCode::BadPayload),
            1008 => Some(CloseCode::PolicyError),
            1009 => Some(CloseCode::TooBig),
            1010 => Some(CloseCode::NeedsExtension),
            1011 => Some(CloseCode::InternalError),
            1012 => Some(CloseCode::ServiceRestart),
            1013 => Some(CloseCode::TryAgainLater),
            1015 => Some(CloseCode::TlsHandshake),
            _ => None,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_code_round_trip() {
        for code in [
            CloseCode::Normal,
            CloseCode::GoingAway,
            CloseCode::ProtocolError,
            CloseCode::UnknownData,
            CloseCode::BadPayload,
            CloseCode::PolicyError,
            CloseCode::TooBig,
            CloseCode::NeedsExtension,
            CloseCode::InternalError,
            CloseCode::ServiceRestart,
            CloseCode::TryAgainLater,
            CloseCode::TlsHandshake,
        ] {
            assert_eq!(CloseCode::from_u16(code as u16), Some(code));
        }
        assert_eq!(CloseCode::from_u16(1005), None);
        assert_eq!(CloseCode::from_u16(0), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(Error::from(eof), Error::Eof));

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(Error::from(refused), Error::Io(_)));
    }
}

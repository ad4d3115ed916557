//! Error types for Socksmux
//!
//! Wire-level failures are [`Socks5Error`], per-session failures are
//! [`SessionError`], and the status byte sent back to clients is [`Reply`].

use std::fmt;
use std::io;
use thiserror::Error;

/// SOCKS5 wire and negotiation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Socks5Error {
    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// Unsupported username/password sub-negotiation version
    #[error("Unsupported auth sub-negotiation version: {0}")]
    UnsupportedAuthVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// A length field points past the end of the received bytes
    #[error("Truncated message: needed {needed} bytes, {available} available")]
    TruncatedMessage {
        /// Bytes the message claims to occupy
        needed: usize,
        /// Bytes actually received
        available: usize,
    },

    /// Handshake bytes pending beyond the largest possible message
    #[error("Handshake message too long: {0} bytes pending")]
    MessageTooLong(usize),

    /// UDP relay datagram with a non-zero fragment number
    #[error("Fragmented UDP datagram not supported: frag {0}")]
    FragmentedDatagram(u8),

    /// UDP relay header with a non-zero reserved field
    #[error("Invalid reserved field: {0:#06x}")]
    InvalidReserved(u16),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),
}

impl Socks5Error {
    /// Shorthand for a [`Socks5Error::TruncatedMessage`]
    pub fn truncated(needed: usize, available: usize) -> Self {
        Socks5Error::TruncatedMessage { needed, available }
    }
}

/// Errors that end a session
///
/// Every variant is fatal to the session that produced it and to nothing else.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Malformed or out-of-order client message
    #[error("Protocol violation: {0}")]
    ProtocolViolation(#[from] Socks5Error),

    /// Socket failure other than would-block
    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    /// Orderly EOF from either peer
    #[error("Peer closed connection")]
    PeerClosed,

    /// DNS query or response error, or an empty answer
    #[error("Resolution failure: {0}")]
    ResolutionFailure(String),

    /// No candidate endpoint was reachable
    #[error("Connect failure: {0}")]
    ConnectFailure(String),

    /// A per-session limit was reached
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),
}

impl SessionError {
    /// Whether this is an orderly close rather than a failure
    pub fn is_peer_closed(&self) -> bool {
        matches!(self, SessionError::PeerClosed)
    }
}

/// Result alias for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    /// Command succeeded
    Success = 0x00,
    /// General SOCKS server failure
    GeneralFailure = 0x01,
    /// Connection not allowed by ruleset
    NotAllowed = 0x02,
    /// Network unreachable
    Unreachable = 0x03,
    /// Host unreachable
    HostUnreachable = 0x04,
    /// Connection refused
    ConnectionRefused = 0x05,
    /// TTL expired
    TtlExpired = 0x06,
    /// Command not supported
    CommandNotSupported = 0x07,
    /// Address type not supported
    AddrTypeNotSupported = 0x08,
}

impl Reply {
    /// Reply for a failed outbound connect
    ///
    /// Errors with no closer match are reported as `HostUnreachable`.
    pub fn for_connect_error(err: &io::Error) -> Self {
        match Reply::from(err) {
            Reply::GeneralFailure => Reply::HostUnreachable,
            reply => reply,
        }
    }
}

impl From<Reply> for u8 {
    fn from(reply: Reply) -> Self {
        reply as u8
    }
}

impl TryFrom<u8> for Reply {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Reply::Success),
            0x01 => Ok(Reply::GeneralFailure),
            0x02 => Ok(Reply::NotAllowed),
            0x03 => Ok(Reply::Unreachable),
            0x04 => Ok(Reply::HostUnreachable),
            0x05 => Ok(Reply::ConnectionRefused),
            0x06 => Ok(Reply::TtlExpired),
            0x07 => Ok(Reply::CommandNotSupported),
            0x08 => Ok(Reply::AddrTypeNotSupported),
            other => Err(other),
        }
    }
}

impl From<&io::Error> for Reply {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown => Reply::Unreachable,
            io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::TimedOut => Reply::HostUnreachable,
            io::ErrorKind::AddrNotAvailable => Reply::HostUnreachable,
            io::ErrorKind::PermissionDenied => Reply::NotAllowed,
            _ => Reply::GeneralFailure,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Reply::Success => "succeeded",
            Reply::GeneralFailure => "general failure",
            Reply::NotAllowed => "connection not allowed",
            Reply::Unreachable => "network unreachable",
            Reply::HostUnreachable => "host unreachable",
            Reply::ConnectionRefused => "connection refused",
            Reply::TtlExpired => "TTL expired",
            Reply::CommandNotSupported => "command not supported",
            Reply::AddrTypeNotSupported => "address type not supported",
        };
        f.write_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_from_u8_valid() {
        assert_eq!(Reply::try_from(0x00), Ok(Reply::Success));
        assert_eq!(Reply::try_from(0x03), Ok(Reply::Unreachable));
        assert_eq!(Reply::try_from(0x05), Ok(Reply::ConnectionRefused));
        assert_eq!(Reply::try_from(0x08), Ok(Reply::AddrTypeNotSupported));
    }

    #[test]
    fn test_reply_from_u8_invalid() {
        assert_eq!(Reply::try_from(0x09), Err(0x09));
        assert_eq!(Reply::try_from(0xFF), Err(0xFF));
    }

    #[test]
    fn test_reply_to_u8() {
        for byte in 0x00..=0x08u8 {
            let reply = Reply::try_from(byte).unwrap();
            assert_eq!(u8::from(reply), byte);
        }
    }

    #[test]
    fn test_reply_from_io_error() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Reply::from(&err), Reply::ConnectionRefused);

        let err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(Reply::from(&err), Reply::HostUnreachable);

        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(Reply::from(&err), Reply::NotAllowed);

        let err = io::Error::new(io::ErrorKind::Other, "other");
        assert_eq!(Reply::from(&err), Reply::GeneralFailure);
    }

    #[test]
    fn test_reply_for_connect_error() {
        let err = io::Error::new(io::ErrorKind::Other, "no route");
        assert_eq!(Reply::for_connect_error(&err), Reply::HostUnreachable);

        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(Reply::for_connect_error(&err), Reply::ConnectionRefused);
    }

    #[test]
    fn test_reply_for_unreachable_errors() {
        let err = io::Error::from(io::ErrorKind::NetworkUnreachable);
        assert_eq!(Reply::from(&err), Reply::Unreachable);
        assert_eq!(Reply::for_connect_error(&err), Reply::Unreachable);

        let err = io::Error::from(io::ErrorKind::HostUnreachable);
        assert_eq!(Reply::from(&err), Reply::HostUnreachable);
        assert_eq!(Reply::for_connect_error(&err), Reply::HostUnreachable);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reply_for_unreachable_os_errors() {
        let err = io::Error::from_raw_os_error(libc::ENETUNREACH);
        assert_eq!(Reply::for_connect_error(&err), Reply::Unreachable);

        let err = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(Reply::for_connect_error(&err), Reply::HostUnreachable);
    }

    #[test]
    fn test_socks5_error_display() {
        assert_eq!(
            Socks5Error::UnsupportedVersion(4).to_string(),
            "Unsupported SOCKS version: 4"
        );
        assert_eq!(
            Socks5Error::truncated(10, 3).to_string(),
            "Truncated message: needed 10 bytes, 3 available"
        );
        assert_eq!(
            Socks5Error::InvalidReserved(1).to_string(),
            "Invalid reserved field: 0x0001"
        );
    }

    #[test]
    fn test_session_error_from_socks5_error() {
        let err: SessionError = Socks5Error::AuthFailed.into();
        assert!(matches!(
            err,
            SessionError::ProtocolViolation(Socks5Error::AuthFailed)
        ));
        assert_eq!(err.to_string(), "Protocol violation: Authentication failed");
    }

    #[test]
    fn test_session_error_peer_closed() {
        assert!(SessionError::PeerClosed.is_peer_closed());
        let err: SessionError = io::Error::new(io::ErrorKind::BrokenPipe, "pipe").into();
        assert!(!err.is_peer_closed());
    }
}

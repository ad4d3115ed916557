//! Helper utilities for Socksmux
//!
//! Shared sizes and small socket helpers used by the event loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Bytes moved per stream read
pub const SESSION_BUFFER_SIZE: usize = 16 * 1024;

/// Size of the shared scratch buffer; large enough for any UDP datagram
pub const DATAGRAM_BUFFER_SIZE: usize = 64 * 1024;

/// Backlog of the listening socket
pub const LISTEN_BACKLOG: i32 = 128;

/// Capacity of the poll event batch
pub const EVENT_CAPACITY: usize = 1024;

/// Wildcard address of the same family as `ip`, with port 0
pub fn unspecified_for(ip: IpAddr) -> SocketAddr {
    match ip {
        IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// The error behind an error-readiness event
///
/// `take_error` is the socket's `SO_ERROR` accessor. When the socket reports
/// nothing, the event is described as a reset.
pub fn pending_error<F>(take_error: F) -> io::Error
where
    F: FnOnce() -> io::Result<Option<io::Error>>,
{
    match take_error() {
        Ok(Some(err)) | Err(err) => err,
        Ok(None) => io::ErrorKind::ConnectionReset.into(),
    }
}

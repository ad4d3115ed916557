//! TCP socket options
//!
//! Defines the per-side TCP tuning applied to accepted client sockets and to
//! outbound remote sockets.

use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::io;

/// TCP socket options for one side of a session
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    /// Enable TCP_NODELAY
    #[serde(default)]
    pub nodelay: bool,

    /// Enable SO_KEEPALIVE
    #[serde(default)]
    pub keepalive: bool,
}

impl TcpOptions {
    /// Apply the options to a connected or connecting socket
    ///
    /// Options left disabled are not touched, so the OS defaults stay in effect.
    pub fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        if self.nodelay {
            socket.set_nodelay(true)?;
        }
        if self.keepalive {
            socket.set_keepalive(true)?;
        }
        Ok(())
    }
}

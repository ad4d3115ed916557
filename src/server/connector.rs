//! Outbound connect with sequential fallback
//!
//! Candidates are tried strictly in order, one at a time; the first that
//! connects wins. A candidate is never attempted twice. There is no connect
//! timeout: an attempt that neither completes nor fails keeps the session
//! waiting.

use crate::error::Reply;
use crate::socks::AddressRecord;
use std::io;
use std::net::SocketAddr;

/// Candidate list and progress of one outbound connect
#[derive(Debug)]
pub struct RemoteConnector {
    candidates: Vec<SocketAddr>,
    cursor: usize,
    attempting: Option<SocketAddr>,
    connected: Option<SocketAddr>,
    last_error: Option<io::Error>,
}

impl RemoteConnector {
    /// Create a connector over resolved candidates
    pub fn new(candidates: Vec<SocketAddr>) -> Self {
        RemoteConnector {
            candidates,
            cursor: 0,
            attempting: None,
            connected: None,
            last_error: None,
        }
    }

    /// Move to the next candidate
    ///
    /// Returns `None` once every candidate has been attempted.
    pub fn advance(&mut self) -> Option<SocketAddr> {
        let next = self.candidates.get(self.cursor).copied()?;
        self.cursor += 1;
        self.attempting = Some(next);
        Some(next)
    }

    /// Record why the current attempt failed
    pub fn record_failure(&mut self, err: io::Error) {
        self.last_error = Some(err);
    }

    /// Mark the current attempt as connected
    ///
    /// The remaining candidates are dropped.
    pub fn mark_connected(&mut self, peer: SocketAddr) {
        self.connected = Some(peer);
        self.candidates = Vec::new();
        self.cursor = 0;
    }

    /// Peer of the established connection
    pub fn peer(&self) -> Option<SocketAddr> {
        self.connected
    }

    /// Candidate of the current or last attempt
    pub fn attempting(&self) -> Option<SocketAddr> {
        self.attempting
    }

    /// Number of attempts started so far
    #[cfg(test)]
    pub(crate) fn attempts(&self) -> usize {
        self.cursor
    }

    /// Candidates not yet attempted
    #[cfg(test)]
    pub(crate) fn remaining(&self) -> usize {
        self.candidates.len().saturating_sub(self.cursor)
    }

    /// Error of the most recent failed attempt
    pub fn last_error(&self) -> Option<&io::Error> {
        self.last_error.as_ref()
    }

    /// Reply sent once every candidate has failed
    ///
    /// Carries the address of the last attempted candidate.
    pub fn failure_reply(&self) -> (Reply, AddressRecord) {
        let reply = self
            .last_error
            .as_ref()
            .map(Reply::for_connect_error)
            .unwrap_or(Reply::HostUnreachable);
        let bound = self
            .attempting
            .map(AddressRecord::from)
            .unwrap_or_else(AddressRecord::unspecified);
        (reply, bound)
    }
}

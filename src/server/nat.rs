//! UDP association address translation
//!
//! Datagrams from the client carry a SOCKS5 UDP header naming their
//! destination. The header is stripped before the payload leaves through the
//! remote-facing socket, and the remote port is remembered against the
//! client's source port. Replies are attributed back to a client port
//! through that map alone.

use crate::error::Socks5Error;
use crate::socks::{decode_udp_header, encode_udp_header, AddressRecord};
use bytes::BytesMut;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Default cap on remembered remote ports per association
pub const DEFAULT_PORT_MAP_CAPACITY: usize = 4096;

/// Why a client datagram was not forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Source IP is not the association's client
    ForeignSource(SocketAddr),
    /// Header failed to decode
    Malformed(Socks5Error),
    /// Destination is a domain name
    DomainDestination,
    /// Port map is full and the remote port is new
    PortMapFull,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::ForeignSource(src) => write!(f, "foreign source {}", src),
            DropReason::Malformed(e) => write!(f, "malformed header: {}", e),
            DropReason::DomainDestination => write!(f, "domain destination not supported"),
            DropReason::PortMapFull => write!(f, "port map full"),
        }
    }
}

/// Outcome of translating a client datagram
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound<'a> {
    /// Send `payload` to `dest` through the remote-facing socket
    Forward {
        /// Remote destination
        dest: SocketAddr,
        /// Datagram body without the SOCKS5 header
        payload: &'a [u8],
    },
    /// Discard the datagram
    Drop(DropReason),
}

/// A remote datagram whose source port has no mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unmapped(pub SocketAddr);

impl fmt::Display for Unmapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no client mapping for remote port {}", self.0.port())
    }
}

/// Port map of one UDP association
#[derive(Debug)]
pub struct NatTable {
    client_ip: IpAddr,
    ports: HashMap<u16, u16>,
    capacity: usize,
}

impl NatTable {
    /// Create a table for the client at `client_ip`
    pub fn new(client_ip: IpAddr) -> Self {
        Self::with_capacity(client_ip, DEFAULT_PORT_MAP_CAPACITY)
    }

    /// Create a table with a custom cap on mappings
    pub fn with_capacity(client_ip: IpAddr, capacity: usize) -> Self {
        NatTable {
            client_ip,
            ports: HashMap::new(),
            capacity,
        }
    }

    /// IP the association accepts datagrams from
    pub fn client_ip(&self) -> IpAddr {
        self.client_ip
    }

    /// Number of mapped remote ports
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Check if no ports are mapped
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Client port mapped to `remote_port`
    pub fn client_port(&self, remote_port: u16) -> Option<u16> {
        self.ports.get(&remote_port).copied()
    }

    /// Translate a datagram received from the client
    ///
    /// Only the source IP is checked; the client may send from any port.
    pub fn from_client<'a>(&mut self, datagram: &'a [u8], src: SocketAddr) -> Outbound<'a> {
        if src.ip() != self.client_ip {
            return Outbound::Drop(DropReason::ForeignSource(src));
        }

        let (addr, header_len) = match decode_udp_header(datagram) {
            Ok(decoded) => decoded,
            Err(e) => return Outbound::Drop(DropReason::Malformed(e)),
        };
        let dest = match addr.socket_addr() {
            Some(dest) => dest,
            None => return Outbound::Drop(DropReason::DomainDestination),
        };

        if !self.ports.contains_key(&dest.port()) && self.ports.len() >= self.capacity {
            return Outbound::Drop(DropReason::PortMapFull);
        }
        self.ports.insert(dest.port(), src.port());

        Outbound::Forward {
            dest,
            payload: &datagram[header_len..],
        }
    }

    /// Wrap a datagram received from `remote` for delivery to the client
    ///
    /// Returns the packet and the client endpoint to send it to.
    pub fn to_client(
        &self,
        payload: &[u8],
        remote: SocketAddr,
    ) -> Result<(BytesMut, SocketAddr), Unmapped> {
        let client_port = self.client_port(remote.port()).ok_or(Unmapped(remote))?;

        let mut packet = encode_udp_header(&AddressRecord::from(remote), payload.len());
        packet.extend_from_slice(payload);
        Ok((packet, SocketAddr::new(self.client_ip, client_port)))
    }
}

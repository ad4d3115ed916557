//! SOCKS5 type definitions
//!
//! Defines the structured values the wire codec produces and consumes.

use super::consts::*;
use crate::error::Socks5Error;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// SOCKS5 command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// TCP CONNECT - establish a TCP connection to target
    Connect,
    /// TCP BIND - always answered with `CommandNotSupported`
    Bind,
    /// UDP ASSOCIATE - establish UDP relay
    UdpAssociate,
    /// Any other command byte
    Unknown(u8),
}

impl Command {
    /// Parse a command byte
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            SOCKS5_CMD_TCP_CONNECT => Command::Connect,
            SOCKS5_CMD_TCP_BIND => Command::Bind,
            SOCKS5_CMD_UDP_ASSOCIATE => Command::UdpAssociate,
            other => Command::Unknown(other),
        }
    }

    /// Convert to the command byte
    pub fn to_byte(self) -> u8 {
        match self {
            Command::Connect => SOCKS5_CMD_TCP_CONNECT,
            Command::Bind => SOCKS5_CMD_TCP_BIND,
            Command::UdpAssociate => SOCKS5_CMD_UDP_ASSOCIATE,
            Command::Unknown(byte) => byte,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Connect => write!(f, "CONNECT"),
            Command::Bind => write!(f, "BIND"),
            Command::UdpAssociate => write!(f, "UDP ASSOCIATE"),
            Command::Unknown(byte) => write!(f, "UNKNOWN({:#04x})", byte),
        }
    }
}

/// A domain name of at most 255 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainName(String);

impl DomainName {
    /// Validate and wrap a domain name
    pub fn new(name: impl Into<String>) -> Result<Self, Socks5Error> {
        let name = name.into();
        if name.len() > MAX_DOMAIN_LEN {
            return Err(Socks5Error::InvalidDomain(format!(
                "{} bytes exceeds {}",
                name.len(),
                MAX_DOMAIN_LEN
            )));
        }
        Ok(DomainName(name))
    }

    /// The name as text
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the name is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// SOCKS5 wire address record
///
/// ```text
/// +------+----------+----------+
/// | ATYP | DST.ADDR | DST.PORT |
/// +------+----------+----------+
/// |  1   | Variable |    2     |
/// +------+----------+----------+
/// ```
///
/// A domain address is a length byte followed by that many bytes of name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRecord {
    /// IPv4 address with port
    Ipv4(Ipv4Addr, u16),
    /// IPv6 address with port
    Ipv6(Ipv6Addr, u16),
    /// Domain name with port
    Domain(DomainName, u16),
}

impl AddressRecord {
    /// Create a domain record, validating the name length
    pub fn domain(name: impl Into<String>, port: u16) -> Result<Self, Socks5Error> {
        Ok(AddressRecord::Domain(DomainName::new(name)?, port))
    }

    /// `0.0.0.0:0`, used in replies sent before an address is known
    pub fn unspecified() -> Self {
        AddressRecord::Ipv4(Ipv4Addr::UNSPECIFIED, 0)
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            AddressRecord::Ipv4(_, port)
            | AddressRecord::Ipv6(_, port)
            | AddressRecord::Domain(_, port) => *port,
        }
    }

    /// Get the ATYP byte
    pub fn addr_type(&self) -> u8 {
        match self {
            AddressRecord::Ipv4(..) => SOCKS5_ADDR_TYPE_IPV4,
            AddressRecord::Ipv6(..) => SOCKS5_ADDR_TYPE_IPV6,
            AddressRecord::Domain(..) => SOCKS5_ADDR_TYPE_DOMAIN,
        }
    }

    /// Size of the record on the wire, type byte and port included
    pub fn wire_len(&self) -> usize {
        match self {
            AddressRecord::Ipv4(..) => IPV4_RECORD_LEN,
            AddressRecord::Ipv6(..) => IPV6_RECORD_LEN,
            AddressRecord::Domain(name, _) => DOMAIN_RECORD_OVERHEAD + name.len(),
        }
    }

    /// The literal socket address, if this is not a domain record
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            AddressRecord::Ipv4(ip, port) => Some(SocketAddr::new(IpAddr::V4(*ip), *port)),
            AddressRecord::Ipv6(ip, port) => Some(SocketAddr::new(IpAddr::V6(*ip), *port)),
            AddressRecord::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for AddressRecord {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(v4) => AddressRecord::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => AddressRecord::Ipv6(*v6.ip(), v6.port()),
        }
    }
}

impl fmt::Display for AddressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressRecord::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            AddressRecord::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            AddressRecord::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

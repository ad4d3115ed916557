//! Server configuration types
//!
//! Defines the main configuration structures for the Socksmux server.

use super::TcpOptions;
use crate::socks::{AuthMethod, MAX_DOMAIN_LEN};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

/// Default listen port
pub const DEFAULT_LISTEN_PORT: u16 = 1080;

/// Default DNS server port
pub const DEFAULT_DNS_PORT: u16 = 53;

fn default_listen_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_dns_port() -> u16 {
    DEFAULT_DNS_PORT
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
}

/// Where domain names are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DnsMode {
    /// First nameserver from the system resolver configuration
    #[default]
    Auto,
    /// Domain names are refused with `AddrTypeNotSupported`
    Disabled,
    /// A specific DNS server
    Server(IpAddr),
}

impl FromStr for DnsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(DnsMode::Auto),
            "none" => Ok(DnsMode::Disabled),
            other => other
                .parse::<IpAddr>()
                .map(DnsMode::Server)
                .map_err(|_| format!("Invalid DNS setting '{}': expected auto, none or an IP", s)),
        }
    }
}

impl TryFrom<String> for DnsMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DnsMode> for String {
    fn from(mode: DnsMode) -> Self {
        mode.to_string()
    }
}

impl fmt::Display for DnsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsMode::Auto => write!(f, "auto"),
            DnsMode::Disabled => write!(f, "none"),
            DnsMode::Server(ip) => write!(f, "{}", ip),
        }
    }
}

/// SOCKS5 server configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen IP address
    #[serde(default = "default_listen_ip")]
    pub listen_ip: IpAddr,

    /// Listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Username for SOCKS5 auth; empty disables authentication
    #[serde(default)]
    pub username: String,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: String,

    /// DNS server selection
    #[serde(default)]
    pub dns: DnsMode,

    /// DNS server port
    #[serde(default = "default_dns_port")]
    pub dns_port: u16,

    /// Options for accepted client sockets
    #[serde(default)]
    pub client_tcp: TcpOptions,

    /// Options for outbound remote sockets
    #[serde(default)]
    pub remote_tcp: TcpOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: default_listen_ip(),
            listen_port: default_listen_port(),
            username: String::new(),
            password: String::new(),
            dns: DnsMode::default(),
            dns_port: default_dns_port(),
            client_tcp: TcpOptions::default(),
            remote_tcp: TcpOptions::default(),
        }
    }
}

impl ServerConfig {
    /// Address the listener binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Check if authentication credentials are configured
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    /// The single method clients must negotiate
    pub fn auth_method(&self) -> AuthMethod {
        if self.has_credentials() {
            AuthMethod::Password
        } else {
            AuthMethod::None
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.username.is_empty() != self.password.is_empty() {
            return Err("Username and password must be set together".to_string());
        }
        if self.username.len() > MAX_DOMAIN_LEN || self.password.len() > MAX_DOMAIN_LEN {
            return Err("Username and password are limited to 255 bytes".to_string());
        }
        if let DnsMode::Server(_) = self.dns {
            if self.dns_port == 0 {
                return Err("DNS port must be non-zero".to_string());
            }
        }
        Ok(())
    }
}

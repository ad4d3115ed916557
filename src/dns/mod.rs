//! DNS resolution support
//!
//! Message codec for the per-session DNS query sockets, plus selection of
//! the upstream server from [`DnsMode`].

mod message;
mod resolv;

pub use hickory_proto::rr::RecordType;
pub use message::{build_query, build_response, parse_response, DnsError};
pub use resolv::{parse_nameservers, read_nameservers, RESOLV_CONF_PATH};

use crate::config::DnsMode;
use std::net::SocketAddr;
use tracing::warn;

/// Pick the upstream DNS server for a configuration
///
/// Returns `None` when domain resolution is disabled, either explicitly or
/// because `auto` found no usable nameserver.
pub fn upstream_server(mode: DnsMode, port: u16) -> Option<SocketAddr> {
    match mode {
        DnsMode::Disabled => None,
        DnsMode::Server(ip) => Some(SocketAddr::new(ip, port)),
        DnsMode::Auto => match read_nameservers(RESOLV_CONF_PATH).first() {
            Some(ip) => Some(SocketAddr::new(*ip, port)),
            None => {
                warn!(
                    "No nameserver found in {}, domain resolution disabled",
                    RESOLV_CONF_PATH
                );
                None
            }
        },
    }
}

/// Source of DNS transaction ids
///
/// Starts at a random value and increments per query.
#[derive(Debug)]
pub struct QueryIds {
    next: u16,
}

impl QueryIds {
    /// Create a generator with a random starting id
    pub fn new() -> Self {
        QueryIds {
            next: rand::random(),
        }
    }

    /// Take the next id
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        id
    }
}

impl Default for QueryIds {
    fn default() -> Self {
        Self::new()
    }
}

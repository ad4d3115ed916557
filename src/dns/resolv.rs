//! System resolver configuration

use std::net::IpAddr;
use std::path::Path;
use tracing::warn;

/// Default resolver configuration path
pub const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// Parse `nameserver` entries out of resolv.conf content
///
/// Content that `resolv-conf` rejects yields no nameservers.
pub fn parse_nameservers(content: &str) -> Vec<IpAddr> {
    match resolv_conf::Config::parse(content) {
        Ok(config) => config.nameservers.into_iter().map(Into::into).collect(),
        Err(e) => {
            warn!("Failed to parse resolver configuration: {}", e);
            Vec::new()
        }
    }
}

/// Read nameservers from a resolv.conf file
///
/// A missing or unreadable file yields no nameservers.
pub fn read_nameservers<P: AsRef<Path>>(path: P) -> Vec<IpAddr> {
    std::fs::read_to_string(path)
        .map(|content| parse_nameservers(&content))
        .unwrap_or_default()
}

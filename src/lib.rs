//! # Socksmux - Single-threaded SOCKS5 Server
//!
//! Socksmux is a SOCKS5 proxy server (RFC 1928 subset) driven by one
//! readiness-polling event loop. It serves many clients concurrently on a
//! single thread with non-blocking sockets only.
//!
//! ## Features
//!
//! - **Authentication**: no-auth, or username/password (RFC 1929)
//! - **CONNECT**: IPv4, IPv6 and domain destinations, with sequential
//!   fallback across every resolved address
//! - **UDP ASSOCIATE**: datagram relay with per-association port mapping
//! - **Built-in DNS client**: non-blocking A queries against a configured or
//!   system nameserver
//!
//! ## Usage
//!
//! ```rust,no_run
//! use socksmux::config::ServerConfig;
//! use socksmux::Server;
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut server = Server::bind(ServerConfig::default())?;
//!     let shutdown = server.shutdown_handle();
//!
//!     std::thread::spawn(move || {
//!         std::thread::sleep(std::time::Duration::from_secs(60));
//!         shutdown.shutdown();
//!     });
//!
//!     server.serve()
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! Client --TCP--> Server loop --> Session --TCP/UDP--> Target
//!                                    |
//!                                    +--UDP--> DNS server
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod dns;
pub mod error;
pub mod helper;
pub mod server;
pub mod socks;

// Re-export commonly used items
pub use config::{load_config, Config, ServerConfig};
pub use error::{Reply, SessionError, Socks5Error};
pub use server::{NoopHook, Server, ServerHook, ShutdownHandle};

/// Version of the Socksmux library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_name() {
        assert_eq!(NAME, "socksmux");
    }
}

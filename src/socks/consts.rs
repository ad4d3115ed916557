//! SOCKS5 protocol constants

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// Username/password sub-negotiation version (RFC 1929)
pub const SOCKS5_AUTH_VERSION: u8 = 0x01;

// Authentication methods
/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// GSSAPI authentication (not implemented)
pub const SOCKS5_AUTH_METHOD_GSSAPI: u8 = 0x01;
/// Username/password authentication
pub const SOCKS5_AUTH_METHOD_PASSWORD: u8 = 0x02;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

// Sub-negotiation status
/// Credentials accepted
pub const SOCKS5_AUTH_STATUS_SUCCESS: u8 = 0x00;
/// Credentials rejected
pub const SOCKS5_AUTH_STATUS_FAILURE: u8 = 0xFF;

// Commands
/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;
/// TCP BIND command (always rejected)
pub const SOCKS5_CMD_TCP_BIND: u8 = 0x02;
/// UDP ASSOCIATE command
pub const SOCKS5_CMD_UDP_ASSOCIATE: u8 = 0x03;

// Address types
/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// Reserved byte value (always 0x00)
pub const SOCKS5_RESERVED: u8 = 0x00;

/// Maximum domain name length
pub const MAX_DOMAIN_LEN: usize = 255;

/// Wire size of an IPv4 address record (type + 4 + port)
pub const IPV4_RECORD_LEN: usize = 1 + 4 + 2;
/// Wire size of an IPv6 address record (type + 16 + port)
pub const IPV6_RECORD_LEN: usize = 1 + 16 + 2;
/// Fixed overhead of a domain record (type + length byte + port)
pub const DOMAIN_RECORD_OVERHEAD: usize = 1 + 1 + 2;

/// Largest handshake message: credentials with 255-byte username and password
pub const MAX_HANDSHAKE_MESSAGE_LEN: usize = 1 + 1 + 255 + 1 + 255;

/// Size of the UDP relay header before the address record (RSV + FRAG)
pub const UDP_HEADER_PREFIX_LEN: usize = 3;

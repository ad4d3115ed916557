//! SOCKS5 authentication negotiation
//!
//! Parsing and encoding for the method-selection exchange and the RFC 1929
//! username/password sub-negotiation. The session drives these; nothing here
//! touches a socket.

use super::consts::*;
use crate::error::Socks5Error;
use std::fmt;

/// Authentication method types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// No authentication required
    None,
    /// Username/password authentication
    Password,
}

impl AuthMethod {
    /// Convert to SOCKS5 method byte
    pub fn to_byte(self) -> u8 {
        match self {
            AuthMethod::None => SOCKS5_AUTH_METHOD_NONE,
            AuthMethod::Password => SOCKS5_AUTH_METHOD_PASSWORD,
        }
    }

    /// Parse from SOCKS5 method byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOCKS5_AUTH_METHOD_NONE => Some(AuthMethod::None),
            SOCKS5_AUTH_METHOD_PASSWORD => Some(AuthMethod::Password),
            _ => None,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::None => write!(f, "none"),
            AuthMethod::Password => write!(f, "username/password"),
        }
    }
}

/// Decode the client greeting
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
///
/// Returns the offered method bytes and the number of bytes consumed.
pub fn decode_greeting(buf: &[u8]) -> Result<(&[u8], usize), Socks5Error> {
    if buf.len() < 2 {
        return Err(Socks5Error::truncated(2, buf.len()));
    }
    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let len = 2 + buf[1] as usize;
    if buf.len() < len {
        return Err(Socks5Error::truncated(len, buf.len()));
    }

    Ok((&buf[2..len], len))
}

/// Pick the method the server will use
///
/// The server requires exactly one method: no-auth when no credentials are
/// configured, username/password otherwise.
pub fn select_method(offered: &[u8], required: AuthMethod) -> Option<AuthMethod> {
    if offered.contains(&required.to_byte()) {
        Some(required)
    } else {
        None
    }
}

/// Encode the method selection message
pub fn encode_method_selection(method: Option<AuthMethod>) -> [u8; 2] {
    [
        SOCKS5_VERSION,
        method
            .map(AuthMethod::to_byte)
            .unwrap_or(SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE),
    ]
}

/// Credentials sent in a username/password sub-negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Raw username bytes
    pub username: Vec<u8>,
    /// Raw password bytes
    pub password: Vec<u8>,
}

impl Credentials {
    /// Compare against configured credentials
    pub fn matches(&self, username: &str, password: &str) -> bool {
        self.username == username.as_bytes() && self.password == password.as_bytes()
    }

    /// Username for log output
    pub fn username_lossy(&self) -> String {
        String::from_utf8_lossy(&self.username).into_owned()
    }
}

/// Decode a username/password sub-negotiation message
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
///
/// Both length bytes are checked against the received bytes; a message
/// claiming more than it carries is rejected as truncated.
pub fn decode_credentials(buf: &[u8]) -> Result<(Credentials, usize), Socks5Error> {
    if buf.len() < 2 {
        return Err(Socks5Error::truncated(2, buf.len()));
    }
    if buf[0] != SOCKS5_AUTH_VERSION {
        return Err(Socks5Error::UnsupportedAuthVersion(buf[0]));
    }

    let ulen = buf[1] as usize;
    let plen_at = 2 + ulen;
    if buf.len() < plen_at + 1 {
        return Err(Socks5Error::truncated(plen_at + 1, buf.len()));
    }

    let plen = buf[plen_at] as usize;
    let len = plen_at + 1 + plen;
    if buf.len() < len {
        return Err(Socks5Error::truncated(len, buf.len()));
    }

    let credentials = Credentials {
        username: buf[2..plen_at].to_vec(),
        password: buf[plen_at + 1..len].to_vec(),
    };
    Ok((credentials, len))
}

/// Encode the sub-negotiation status reply
///
/// ```text
/// +----+--------+
/// |VER | STATUS |
/// +----+--------+
/// | 1  |   1    |
/// +----+--------+
/// ```
pub fn encode_auth_status(success: bool) -> [u8; 2] {
    let status = if success {
        SOCKS5_AUTH_STATUS_SUCCESS
    } else {
        SOCKS5_AUTH_STATUS_FAILURE
    };
    [SOCKS5_AUTH_VERSION, status]
}

/// Encode a sub-negotiation message, as a client would send it
pub fn encode_credentials(username: &[u8], password: &[u8]) -> Result<Vec<u8>, Socks5Error> {
    if username.len() > 255 || password.len() > 255 {
        return Err(Socks5Error::AuthFailed);
    }

    let mut buf = Vec::with_capacity(3 + username.len() + password.len());
    buf.push(SOCKS5_AUTH_VERSION);
    buf.push(username.len() as u8);
    buf.extend_from_slice(username);
    buf.push(password.len() as u8);
    buf.extend_from_slice(password);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_to_byte() {
        assert_eq!(AuthMethod::None.to_byte(), SOCKS5_AUTH_METHOD_NONE);
        assert_eq!(AuthMethod::Password.to_byte(), SOCKS5_AUTH_METHOD_PASSWORD);
    }

    #[test]
    fn test_auth_method_from_byte() {
        assert_eq!(AuthMethod::from_byte(0x00), Some(AuthMethod::None));
        assert_eq!(AuthMethod::from_byte(0x02), Some(AuthMethod::Password));
        assert_eq!(AuthMethod::from_byte(0x01), None);
    }

    #[test]
    fn test_decode_greeting() {
        let buf = [SOCKS5_VERSION, 2, 0x00, 0x02, 0xAA];
        let (methods, len) = decode_greeting(&buf).unwrap();
        assert_eq!(methods, &[0x00, 0x02]);
        assert_eq!(len, 4);
    }

    #[test]
    fn test_decode_greeting_bad_version() {
        assert_eq!(
            decode_greeting(&[0x04, 1, 0x00]),
            Err(Socks5Error::UnsupportedVersion(0x04))
        );
    }

    #[test]
    fn test_decode_greeting_truncated_methods() {
        assert_eq!(
            decode_greeting(&[SOCKS5_VERSION, 5, 0x00]),
            Err(Socks5Error::truncated(7, 3))
        );
    }

    #[test]
    fn test_select_no_auth() {
        assert_eq!(
            select_method(&[0x02, 0x00], AuthMethod::None),
            Some(AuthMethod::None)
        );
        assert_eq!(select_method(&[0x02], AuthMethod::None), None);
    }

    #[test]
    fn test_select_password_only() {
        assert_eq!(select_method(&[0x00], AuthMethod::Password), None);
        assert_eq!(
            select_method(&[0x00, 0x01, 0x02], AuthMethod::Password),
            Some(AuthMethod::Password)
        );
    }

    #[test]
    fn test_encode_method_selection() {
        assert_eq!(encode_method_selection(Some(AuthMethod::Password)), [5, 2]);
        assert_eq!(encode_method_selection(None), [5, 0xFF]);
    }

    #[test]
    fn test_decode_credentials() {
        let buf = encode_credentials(b"u", b"p").unwrap();
        let (creds, len) = decode_credentials(&buf).unwrap();
        assert_eq!(len, buf.len());
        assert!(creds.matches("u", "p"));
        assert!(!creds.matches("u", "q"));
        assert!(!creds.matches("user", "p"));
    }

    #[test]
    fn test_decode_credentials_ulen_past_buffer() {
        // ulen says 50, only 2 bytes of username follow
        let buf = [SOCKS5_AUTH_VERSION, 50, b'a', b'b'];
        assert_eq!(
            decode_credentials(&buf),
            Err(Socks5Error::truncated(53, 4))
        );
    }

    #[test]
    fn test_decode_credentials_plen_past_buffer() {
        let buf = [SOCKS5_AUTH_VERSION, 1, b'u', 9, b'p'];
        assert_eq!(
            decode_credentials(&buf),
            Err(Socks5Error::truncated(13, 5))
        );
    }

    #[test]
    fn test_decode_credentials_bad_version() {
        assert_eq!(
            decode_credentials(&[0x05, 1, b'u', 1, b'p']),
            Err(Socks5Error::UnsupportedAuthVersion(0x05))
        );
    }

    #[test]
    fn test_encode_auth_status() {
        assert_eq!(encode_auth_status(true), [0x01, 0x00]);
        assert_eq!(encode_auth_status(false), [0x01, 0xFF]);
    }
}

//! SOCKS5 wire protocol
//!
//! Pure parsing and serialization for the SOCKS5 handshake, command
//! requests, replies and UDP relay headers. The server's session state
//! machine feeds received bytes through these functions.

pub mod auth;
pub mod codec;
mod consts;
mod types;
pub mod udp;

pub use auth::{
    decode_credentials, decode_greeting, encode_auth_status, encode_credentials,
    encode_method_selection, select_method, AuthMethod, Credentials,
};
pub use codec::{
    decode_address, decode_command, decode_reply, encode_address, encode_command, encode_reply,
    CommandRequest,
};
pub use consts::*;
pub use types::{AddressRecord, Command, DomainName};
pub use udp::{decode_udp_header, encode_udp_header};

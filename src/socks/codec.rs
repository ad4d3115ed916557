//! SOCKS5 message codec
//!
//! Parses and serializes address records, command requests and replies over
//! bounded byte slices. Every length field is checked against the bytes
//! actually available before it is trusted.

use super::consts::*;
use super::types::{AddressRecord, Command, DomainName};
use crate::error::{Reply, Socks5Error};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// A decoded command request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Requested command
    pub command: Command,
    /// Destination address
    pub address: AddressRecord,
    /// Bytes consumed from the input
    pub len: usize,
}

fn need(buf: &[u8], needed: usize) -> Result<(), Socks5Error> {
    if buf.len() < needed {
        return Err(Socks5Error::truncated(needed, buf.len()));
    }
    Ok(())
}

/// Decode an address record from the start of `buf`
///
/// Returns the record and the number of bytes it occupies. Bytes past the
/// record are never read.
pub fn decode_address(buf: &[u8]) -> Result<(AddressRecord, usize), Socks5Error> {
    need(buf, 1)?;

    match buf[0] {
        SOCKS5_ADDR_TYPE_IPV4 => {
            need(buf, IPV4_RECORD_LEN)?;
            let mut rest = &buf[1..IPV4_RECORD_LEN];
            let ip = Ipv4Addr::from(rest.get_u32());
            let port = rest.get_u16();
            Ok((AddressRecord::Ipv4(ip, port), IPV4_RECORD_LEN))
        }

        SOCKS5_ADDR_TYPE_IPV6 => {
            need(buf, IPV6_RECORD_LEN)?;
            let mut rest = &buf[1..IPV6_RECORD_LEN];
            let ip = Ipv6Addr::from(rest.get_u128());
            let port = rest.get_u16();
            Ok((AddressRecord::Ipv6(ip, port), IPV6_RECORD_LEN))
        }

        SOCKS5_ADDR_TYPE_DOMAIN => {
            need(buf, 2)?;
            let name_len = buf[1] as usize;
            let size = DOMAIN_RECORD_OVERHEAD + name_len;
            need(buf, size)?;

            let name = std::str::from_utf8(&buf[2..2 + name_len])
                .map_err(|_| Socks5Error::InvalidDomain("name is not valid UTF-8".to_string()))?;
            let port = (&buf[size - 2..size]).get_u16();
            Ok((AddressRecord::Domain(DomainName::new(name)?, port), size))
        }

        other => Err(Socks5Error::AddressTypeNotSupported(other)),
    }
}

/// Append the wire form of `addr` to `buf`
pub fn encode_address(addr: &AddressRecord, buf: &mut BytesMut) {
    buf.reserve(addr.wire_len());
    buf.put_u8(addr.addr_type());

    match addr {
        AddressRecord::Ipv4(ip, port) => {
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        AddressRecord::Ipv6(ip, port) => {
            buf.put_slice(&ip.octets());
            buf.put_u16(*port);
        }
        AddressRecord::Domain(name, port) => {
            // DomainName guarantees the length fits in one byte
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_str().as_bytes());
            buf.put_u16(*port);
        }
    }
}

/// Decode a command request
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn decode_command(buf: &[u8]) -> Result<CommandRequest, Socks5Error> {
    need(buf, 4)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let command = Command::from_byte(buf[1]);
    let (address, addr_len) = decode_address(&buf[3..])?;

    Ok(CommandRequest {
        command,
        address,
        len: 3 + addr_len,
    })
}

/// Encode a command request, as a client would send it
pub fn encode_command(command: Command, addr: &AddressRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + addr.wire_len());
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(command.to_byte());
    buf.put_u8(SOCKS5_RESERVED);
    encode_address(addr, &mut buf);
    buf.freeze()
}

/// Encode a reply
///
/// # SOCKS5 Reply Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn encode_reply(reply: Reply, bound: &AddressRecord) -> Bytes {
    let mut buf = BytesMut::with_capacity(3 + bound.wire_len());
    buf.put_u8(SOCKS5_VERSION);
    buf.put_u8(reply.into());
    buf.put_u8(SOCKS5_RESERVED);
    encode_address(bound, &mut buf);
    buf.freeze()
}

/// Decode a reply, as a client would receive it
pub fn decode_reply(buf: &[u8]) -> Result<(u8, AddressRecord), Socks5Error> {
    need(buf, 4)?;

    if buf[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(buf[0]));
    }

    let (address, _) = decode_address(&buf[3..])?;
    Ok((buf[1], address))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(addr: &AddressRecord) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_address(addr, &mut buf);
        buf.to_vec()
    }

    #[test]
    fn test_address_round_trip() {
        let records = [
            AddressRecord::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 80),
            AddressRecord::Ipv6(Ipv6Addr::LOCALHOST, 65535),
            AddressRecord::domain("example.com", 443).unwrap(),
            AddressRecord::domain("", 1).unwrap(),
            AddressRecord::domain("d".repeat(255), 53).unwrap(),
        ];

        for record in records {
            let bytes = encoded(&record);
            assert_eq!(bytes.len(), record.wire_len());
            let (decoded, size) = decode_address(&bytes).unwrap();
            assert_eq!(decoded, record);
            assert_eq!(size, record.wire_len());
        }
    }

    #[test]
    fn test_encode_ipv4_layout() {
        let bytes = encoded(&AddressRecord::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 0x1F90));
        assert_eq!(bytes, vec![SOCKS5_ADDR_TYPE_IPV4, 10, 0, 0, 1, 0x1F, 0x90]);
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let mut bytes = encoded(&AddressRecord::domain("a.b", 8080).unwrap());
        bytes.extend_from_slice(b"payload");
        let (record, size) = decode_address(&bytes).unwrap();
        assert_eq!(size, 7);
        assert_eq!(record.port(), 8080);
    }

    #[test]
    fn test_decode_domain_length_past_buffer() {
        // Claims 200 bytes of name, provides 3
        let bytes = [SOCKS5_ADDR_TYPE_DOMAIN, 200, b'a', b'b', b'c', 0, 80];
        assert_eq!(
            decode_address(&bytes),
            Err(Socks5Error::truncated(204, 7))
        );
    }

    #[test]
    fn test_decode_truncated_ip_records() {
        assert_eq!(
            decode_address(&[SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0]),
            Err(Socks5Error::truncated(7, 4))
        );
        assert_eq!(
            decode_address(&[SOCKS5_ADDR_TYPE_IPV6, 0, 0]),
            Err(Socks5Error::truncated(19, 3))
        );
        assert_eq!(decode_address(&[]), Err(Socks5Error::truncated(1, 0)));
        assert_eq!(
            decode_address(&[SOCKS5_ADDR_TYPE_DOMAIN]),
            Err(Socks5Error::truncated(2, 1))
        );
    }

    #[test]
    fn test_decode_unknown_address_type() {
        assert_eq!(
            decode_address(&[0x02, 1, 2, 3, 4, 0, 80]),
            Err(Socks5Error::AddressTypeNotSupported(0x02))
        );
    }

    #[test]
    fn test_decode_domain_invalid_utf8() {
        let bytes = [SOCKS5_ADDR_TYPE_DOMAIN, 2, 0xFF, 0xFE, 0, 80];
        assert!(matches!(
            decode_address(&bytes),
            Err(Socks5Error::InvalidDomain(_))
        ));
    }

    #[test]
    fn test_decode_command_connect() {
        let addr = AddressRecord::domain("example.com", 443).unwrap();
        let bytes = encode_command(Command::Connect, &addr);
        let request = decode_command(&bytes).unwrap();
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.address, addr);
        assert_eq!(request.len, bytes.len());
    }

    #[test]
    fn test_decode_command_unknown() {
        let addr = AddressRecord::Ipv4(Ipv4Addr::LOCALHOST, 80);
        let bytes = encode_command(Command::Unknown(0x7F), &addr);
        let request = decode_command(&bytes).unwrap();
        assert_eq!(request.command, Command::Unknown(0x7F));
    }

    #[test]
    fn test_decode_command_bad_version() {
        let bytes = [0x04, SOCKS5_CMD_TCP_CONNECT, 0, SOCKS5_ADDR_TYPE_IPV4, 1, 2, 3, 4, 0, 80];
        assert_eq!(
            decode_command(&bytes),
            Err(Socks5Error::UnsupportedVersion(0x04))
        );
    }

    #[test]
    fn test_decode_command_too_short() {
        assert_eq!(
            decode_command(&[SOCKS5_VERSION, 1]),
            Err(Socks5Error::truncated(4, 2))
        );
    }

    #[test]
    fn test_encode_reply_ipv4() {
        let bound = AddressRecord::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 1080);
        let reply = encode_reply(Reply::Success, &bound);
        assert_eq!(
            reply.as_ref(),
            &[SOCKS5_VERSION, 0x00, SOCKS5_RESERVED, SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x04, 0x38]
        );
    }

    #[test]
    fn test_encode_reply_failure_unspecified() {
        let reply = encode_reply(Reply::CommandNotSupported, &AddressRecord::unspecified());
        assert_eq!(reply.len(), 10);
        assert_eq!(reply[1], 0x07);
        let (code, addr) = decode_reply(&reply).unwrap();
        assert_eq!(code, 0x07);
        assert_eq!(addr, AddressRecord::unspecified());
    }
}

//! UDP relay header encoding/decoding for SOCKS5
//!
//! # UDP Request/Response Format
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use super::codec::{decode_address, encode_address};
use super::consts::UDP_HEADER_PREFIX_LEN;
use super::types::AddressRecord;
use crate::error::Socks5Error;
use bytes::{Buf, BufMut, BytesMut};

/// Decode a UDP relay header
///
/// Returns the destination record and the total header length, so the
/// payload starts at `&buf[len..]`. Fragmented datagrams are rejected.
pub fn decode_udp_header(buf: &[u8]) -> Result<(AddressRecord, usize), Socks5Error> {
    if buf.len() < UDP_HEADER_PREFIX_LEN {
        return Err(Socks5Error::truncated(UDP_HEADER_PREFIX_LEN, buf.len()));
    }

    let mut prefix = &buf[..UDP_HEADER_PREFIX_LEN];
    let rsv = prefix.get_u16();
    if rsv != 0 {
        return Err(Socks5Error::InvalidReserved(rsv));
    }

    let frag = prefix.get_u8();
    if frag != 0 {
        return Err(Socks5Error::FragmentedDatagram(frag));
    }

    let (addr, addr_len) = decode_address(&buf[UDP_HEADER_PREFIX_LEN..])?;
    Ok((addr, UDP_HEADER_PREFIX_LEN + addr_len))
}

/// Encode a UDP relay header with room reserved for `payload_len` more bytes
pub fn encode_udp_header(addr: &AddressRecord, payload_len: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(UDP_HEADER_PREFIX_LEN + addr.wire_len() + payload_len);
    buf.put_u16(0);
    buf.put_u8(0);
    encode_address(addr, &mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks::consts::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_encode_udp_header_ipv4() {
        let addr = AddressRecord::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 80);
        let mut packet = encode_udp_header(&addr, 4);
        packet.extend_from_slice(b"test");

        // RSV (2) + FRAG (1) + ATYP (1) + IPv4 (4) + PORT (2) + DATA (4)
        assert_eq!(packet.len(), 2 + 1 + 1 + 4 + 2 + 4);
        assert_eq!(&packet[0..2], &[0, 0]);
        assert_eq!(packet[2], 0);
        assert_eq!(packet[3], SOCKS5_ADDR_TYPE_IPV4);
        assert_eq!(&packet[4..8], &[10, 0, 0, 1]);
        assert_eq!(&packet[8..10], &80u16.to_be_bytes());
        assert_eq!(&packet[10..], b"test");
    }

    #[test]
    fn test_decode_udp_header_payload_offset() {
        let addr = AddressRecord::domain("example.org", 8080).unwrap();
        let mut packet = encode_udp_header(&addr, 7);
        packet.extend_from_slice(b"content");

        let (decoded, len) = decode_udp_header(&packet).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(&packet[len..], b"content");
    }

    #[test]
    fn test_decode_udp_header_too_short() {
        assert_eq!(
            decode_udp_header(&[0, 0]),
            Err(Socks5Error::truncated(3, 2))
        );
        assert!(decode_udp_header(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_decode_udp_header_fragmented() {
        let addr = AddressRecord::Ipv4(Ipv4Addr::LOCALHOST, 53);
        let mut packet = encode_udp_header(&addr, 0);
        packet[2] = 1;
        assert_eq!(
            decode_udp_header(&packet),
            Err(Socks5Error::FragmentedDatagram(1))
        );
    }

    #[test]
    fn test_decode_udp_header_invalid_rsv() {
        let addr = AddressRecord::Ipv4(Ipv4Addr::UNSPECIFIED, 0);
        let mut packet = encode_udp_header(&addr, 0);
        packet[0] = 1;
        assert_eq!(
            decode_udp_header(&packet),
            Err(Socks5Error::InvalidReserved(0x0100))
        );
    }
}

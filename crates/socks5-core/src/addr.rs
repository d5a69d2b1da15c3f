//! Pure encode/decode functions for the SOCKS5 address tuple
//! (ATYP, ADDR, PORT). No I/O happens here; callers own reading the right
//! number of bytes off the wire and handing them in.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut};

use crate::{
    error::{Error, UnsupportedAddressTypeSnafu},
    types::{AddrType, Host, TargetAddr},
};

/// Number of bytes following ATYP that a fixed-width address occupies
/// (address bytes only, not the trailing port). `None` for `Domain`, whose
/// length is only known after reading the length-prefix byte.
pub fn fixed_addr_len(atyp: AddrType) -> Option<usize> {
    match atyp {
        AddrType::V4 => Some(4),
        AddrType::V6 => Some(16),
        AddrType::Domain | AddrType::Other(_) => None,
    }
}

/// Decodes an already-known-type IPv4 address from exactly 4 bytes.
pub fn decode_v4(bytes: &[u8; 4]) -> Ipv4Addr {
    Ipv4Addr::from(*bytes)
}

/// Decodes an already-known-type IPv6 address from exactly 16 bytes.
pub fn decode_v6(bytes: &[u8; 16]) -> Ipv6Addr {
    Ipv6Addr::from(*bytes)
}

/// Decodes a domain name from its raw UTF-8 bytes (1..255 long, already
/// sliced to length `L` by the caller).
pub fn decode_domain(bytes: &[u8]) -> Result<String, Error> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| UnsupportedAddressTypeSnafu.build())
}

/// Builds a `Host` from an ATYP tag and the address bytes that follow it
/// (NOT including the port).
pub fn decode_host(atyp: u8, addr_bytes: &[u8]) -> Result<Host, Error> {
    match AddrType::from(atyp) {
        AddrType::V4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(addr_bytes);
            Ok(Host::V4(decode_v4(&b)))
        }
        AddrType::V6 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(addr_bytes);
            Ok(Host::V6(decode_v6(&b)))
        }
        AddrType::Domain => Ok(Host::Domain(decode_domain(addr_bytes)?)),
        AddrType::Other(_) => UnsupportedAddressTypeSnafu.fail(),
    }
}

/// Encodes a bound local/remote endpoint into the wire's ATYP + ADDR + PORT
/// shape. Domain form is never emitted by a server reply.
pub fn encode_endpoint(ep: SocketAddr, buf: &mut impl BufMut) -> AddrType {
    match ep {
        SocketAddr::V4(v4) => {
            buf.put_u8(AddrType::V4.into());
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
            AddrType::V4
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(AddrType::V6.into());
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
            AddrType::V6
        }
    }
}

/// Encodes a `TargetAddr` (which may be a domain name) for contexts that do
/// allow domain form on the wire, such as a UDP datagram header.
pub fn encode_target(target: &TargetAddr, buf: &mut impl BufMut) {
    match &target.host {
        Host::V4(ip) => {
            buf.put_u8(AddrType::V4.into());
            buf.put_slice(&ip.octets());
        }
        Host::V6(ip) => {
            buf.put_u8(AddrType::V6.into());
            buf.put_slice(&ip.octets());
        }
        Host::Domain(name) => {
            buf.put_u8(AddrType::Domain.into());
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
    }
    buf.put_u16(target.port);
}

/// Parses a `TargetAddr` out of a buffer that begins with ATYP, returning
/// the remaining unconsumed bytes. Used by the UDP datagram decoder, which
/// already has the whole packet in memory.
pub fn decode_target(mut buf: &[u8]) -> Result<(TargetAddr, &[u8]), Error> {
    if buf.is_empty() {
        return UnsupportedAddressTypeSnafu.fail();
    }
    let atyp = buf.get_u8();
    let host = match AddrType::from(atyp) {
        AddrType::V4 => {
            if buf.len() < 4 + 2 {
                return UnsupportedAddressTypeSnafu.fail();
            }
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            Host::V4(Ipv4Addr::from(octets))
        }
        AddrType::V6 => {
            if buf.len() < 16 + 2 {
                return UnsupportedAddressTypeSnafu.fail();
            }
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            Host::V6(Ipv6Addr::from(octets))
        }
        AddrType::Domain => {
            if buf.is_empty() {
                return UnsupportedAddressTypeSnafu.fail();
            }
            let len = buf.get_u8() as usize;
            if buf.len() < len + 2 {
                return UnsupportedAddressTypeSnafu.fail();
            }
            let name = decode_domain(&buf[..len])?;
            buf.advance(len);
            Host::Domain(name)
        }
        AddrType::Other(_) => return UnsupportedAddressTypeSnafu.fail(),
    };
    let port = buf.get_u16();
    Ok((TargetAddr::new(host, port), buf))
}

/// "a.b.c.d" for IPv4, bracketed compressed form for IPv6, literal string
/// for a domain.
pub fn format_host(host: &Host) -> String {
    host.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Host;

    #[test]
    fn round_trip_v4() {
        let ep: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let mut buf = Vec::new();
        let atyp = encode_endpoint(ep, &mut buf);
        assert_eq!(atyp, AddrType::V4);
        let addr_bytes = &buf[1..5];
        let port = u16::from_be_bytes([buf[5], buf[6]]);
        let host = decode_host(buf[0], addr_bytes).unwrap();
        assert_eq!(host, Host::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);
    }

    #[test]
    fn round_trip_v6() {
        let ep: SocketAddr = "[::1]:53".parse().unwrap();
        let mut buf = Vec::new();
        let atyp = encode_endpoint(ep, &mut buf);
        assert_eq!(atyp, AddrType::V6);
        let addr_bytes = &buf[1..17];
        let port = u16::from_be_bytes([buf[17], buf[18]]);
        let host = decode_host(buf[0], addr_bytes).unwrap();
        assert_eq!(host, Host::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 53);
    }

    #[test]
    fn decode_target_domain() {
        let target = TargetAddr::new(Host::Domain("example.com".into()), 443);
        let mut buf = Vec::new();
        encode_target(&target, &mut buf);
        let (decoded, rest) = decode_target(&buf).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded.port, 443);
        assert_eq!(decoded.host, Host::Domain("example.com".into()));
    }

    #[test]
    fn unsupported_atyp_rejected() {
        let buf = [0x7F, 0, 0];
        assert!(decode_target(&buf).is_err());
    }
}

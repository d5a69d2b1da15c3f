//! UDP ASSOCIATE: the relay socket, peer binding, per-datagram header
//! parse/emit, and per-direction routing.
//!
//! One relay socket serves one association: a single outstanding receive
//! dispatches each datagram by sender identity against the bound client and
//! upstream endpoints. A narrower peer-binding rule than some servers use
//! is applied deliberately here: an unverified first sender is only
//! trusted when the UDP ASSOCIATE request's own DST.ADDR/DST.PORT were
//! themselves all-zero; see DESIGN.md.

use std::{net::SocketAddr, sync::Arc};

use arc_swap::ArcSwap;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::{
    addr::{decode_target, encode_target},
    deadline::DeadlineGuard,
    error::{Error, UdpFragNotSupportedSnafu, UdpHeaderMalformedSnafu},
    info,
    resolver::Resolver,
    types::{Host, TargetAddr},
    warn,
};

/// Maximum size of a single UDP datagram we will ever read or write.
/// Matches the header + payload ceiling a reply frame can ever need.
pub const UDP_BUFFER_SIZE: usize = 8 * 1024 + 64;

/// Decodes one client-to-server UDP datagram: `RSV(2) FRAG(1) ATYP(1)
/// DST.ADDR DST.PORT DATA`. Returns the destination and the remaining
/// payload bytes. A non-zero RSV or FRAG, or a footer that does not fit the
/// bytes received, is `UdpHeaderMalformed`/`UdpFragNotSupported` and the
/// caller is expected to terminate the session.
pub fn decode_datagram(buf: &[u8]) -> Result<(TargetAddr, Bytes), Error> {
    if buf.len() < 4 {
        return UdpHeaderMalformedSnafu.fail();
    }
    let rsv = u16::from_be_bytes([buf[0], buf[1]]);
    let frag = buf[2];
    if rsv != 0x0000 {
        return UdpHeaderMalformedSnafu.fail();
    }
    if frag != 0 {
        return UdpFragNotSupportedSnafu.fail();
    }
    let (target, payload) = decode_target(&buf[3..]).map_err(|_| UdpHeaderMalformedSnafu.build())?;
    Ok((target, Bytes::copy_from_slice(payload)))
}

/// Encodes one server-to-client UDP datagram with a fresh RSV=0/FRAG=0
/// header in front of `payload`.
pub fn encode_datagram(target: &TargetAddr, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(4 + 22 + payload.len());
    buf.put_u16(0x0000);
    buf.put_u8(0);
    encode_target(target, &mut buf);
    buf.put_slice(payload);
    buf
}

/// What the server will accept as the client's source endpoint, derived
/// from the UDP ASSOCIATE request's DST.ADDR/DST.PORT.
enum ExpectedClient {
    /// The request carried an all-zeros address: any first sender binds.
    Unknown,
    /// A literal IPv4/IPv6 address: only that exact endpoint may bind.
    Literal(SocketAddr),
    /// A domain name, already resolved: any endpoint in the set may bind.
    Resolved(Vec<SocketAddr>),
}

impl ExpectedClient {
    fn matches(&self, src: SocketAddr) -> bool {
        match self {
            ExpectedClient::Unknown => true,
            ExpectedClient::Literal(addr) => *addr == src,
            ExpectedClient::Resolved(set) => set.contains(&src),
        }
    }
}

/// One UDP ASSOCIATE relay: a bound socket plus the client/upstream peers
/// it has learned so far.
pub struct UdpAssociation<R: Resolver> {
    socket: UdpSocket,
    local_addr: SocketAddr,
    expected_client: ExpectedClient,
    client: ArcSwap<Option<SocketAddr>>,
    upstream: ArcSwap<Option<SocketAddr>>,
    resolver: Arc<R>,
    deadline: DeadlineGuard,
    token: CancellationToken,
}

impl<R: Resolver> UdpAssociation<R> {
    /// Binds the relay socket on an ephemeral port of the given address
    /// family (matching the client TCP socket's local family),
    /// and resolves the request's DST.ADDR/DST.PORT into an `ExpectedClient`
    /// (resolving a domain name through the same facade CONNECT uses).
    pub async fn bind(
        family_hint: SocketAddr,
        request_target: &TargetAddr,
        resolver: Arc<R>,
        deadline: DeadlineGuard,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        let bind_addr = match family_hint {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
        };
        let sock = socket2::Socket::new(
            socket2::Domain::for_address(bind_addr),
            socket2::Type::DGRAM,
            None,
        )?;
        sock.set_nonblocking(true)?;
        sock.bind(&bind_addr.into())?;
        let socket = UdpSocket::from_std(sock.into())?;
        let local_addr = socket.local_addr()?;

        let expected_client = if request_target.is_all_zeros() {
            ExpectedClient::Unknown
        } else if let Ok(literal) = SocketAddr::try_from(request_target) {
            ExpectedClient::Literal(literal)
        } else {
            let Host::Domain(name) = &request_target.host else {
                unreachable!("try_from only fails for Domain hosts")
            };
            let endpoints = crate::resolver::resolve_or_unreachable(&*resolver, name, request_target.port).await?;
            ExpectedClient::Resolved(endpoints)
        };

        Ok(Self {
            socket,
            local_addr,
            expected_client,
            client: ArcSwap::new(Arc::new(None)),
            upstream: ArcSwap::new(Arc::new(None)),
            resolver,
            deadline,
            token,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Drives the single outstanding receive on the relay socket until the
    /// session is cancelled (TCP control connection closed, idle timeout,
    /// or a hostile datagram). Dispatch is by sender identity, per
    /// its receive loop dispatching by sender identity.
    pub async fn run(self: Arc<Self>) {
        let mut buf = [0u8; UDP_BUFFER_SIZE];
        loop {
            let (len, src) = tokio::select! {
                _ = self.token.cancelled() => return,
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(target: "[UDP]", "relay socket error: {err}");
                        return;
                    }
                },
            };

            if self.is_from_client(src) {
                if !self.handle_client_datagram(&buf[..len]).await {
                    self.token.cancel();
                    return;
                }
            } else if self.is_from_upstream(src) {
                self.handle_upstream_datagram(src, &buf[..len]).await;
            } else if self.client.load().is_none() && self.expected_client.matches(src) {
                self.client.store(Arc::new(Some(src)));
                info!(target: "[UDP]", "bound client endpoint {src}");
                if !self.handle_client_datagram(&buf[..len]).await {
                    self.token.cancel();
                    return;
                }
            } else {
                // Peer does not match any known or expected endpoint: drop
                // silently and keep receiving.
            }
        }
    }

    fn is_from_client(&self, src: SocketAddr) -> bool {
        matches!(**self.client.load(), Some(addr) if addr == src)
    }

    fn is_from_upstream(&self, src: SocketAddr) -> bool {
        matches!(**self.upstream.load(), Some(addr) if addr == src)
    }

    /// Returns `false` when the datagram was malformed and the session
    /// must be terminated.
    async fn handle_client_datagram(&self, raw: &[u8]) -> bool {
        let (target, payload) = match decode_datagram(raw) {
            Ok(v) => v,
            Err(err) => {
                warn!(target: "[UDP]", "dropping hostile datagram: {err}");
                return false;
            }
        };

        let candidates: Vec<SocketAddr> = match &target.host {
            Host::Domain(name) => match crate::resolver::resolve_or_unreachable(&*self.resolver, name, target.port).await {
                Ok(v) => v,
                Err(_) => return true,
            },
            _ => match SocketAddr::try_from(&target) {
                Ok(addr) => vec![addr],
                Err(_) => return true,
            },
        };

        for dest in candidates {
            if self.socket.send_to(&payload, dest).await.is_ok() {
                self.upstream.store(Arc::new(Some(dest)));
                self.deadline.renew();
                return true;
            }
        }
        true
    }

    async fn handle_upstream_datagram(&self, src: SocketAddr, payload: &[u8]) {
        let Some(client) = **self.client.load() else {
            return;
        };
        let target = TargetAddr::from(src);
        let framed = encode_datagram(&target, payload);
        if let Err(err) = self.socket.send_to(&framed, client).await {
            warn!(target: "[UDP]", "failed relaying to client {client}: {err}");
            return;
        }
        self.deadline.renew();
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::types::Host;

    #[test]
    fn decode_rejects_nonzero_rsv() {
        let buf = [0x00, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(matches!(decode_datagram(&buf), Err(Error::UdpHeaderMalformed { .. })));
    }

    #[test]
    fn decode_rejects_nonzero_frag() {
        let buf = [0x00, 0x00, 0x01, 0x01, 1, 2, 3, 4, 0, 80];
        assert!(matches!(decode_datagram(&buf), Err(Error::UdpFragNotSupported { .. })));
    }

    #[test]
    fn decode_rejects_short_ipv4_footer() {
        let buf = [0x00, 0x00, 0x00, 0x01, 1, 2, 3];
        assert!(decode_datagram(&buf).is_err());
    }

    #[test]
    fn round_trips_ipv4_datagram() {
        let target = TargetAddr::new(Host::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
        let framed = encode_datagram(&target, b"ping");
        let (decoded, payload) = decode_datagram(&framed).unwrap();
        assert_eq!(decoded.port, 53);
        assert_eq!(decoded.host, Host::V4(Ipv4Addr::new(8, 8, 8, 8)));
        assert_eq!(&payload[..], b"ping");
    }

    #[test]
    fn expected_client_unknown_matches_anything() {
        let expected = ExpectedClient::Unknown;
        assert!(expected.matches("1.2.3.4:1".parse().unwrap()));
    }

    #[test]
    fn expected_client_literal_is_exact() {
        let addr: SocketAddr = "1.2.3.4:9".parse().unwrap();
        let expected = ExpectedClient::Literal(addr);
        assert!(expected.matches(addr));
        assert!(!expected.matches("1.2.3.4:10".parse().unwrap()));
    }
}

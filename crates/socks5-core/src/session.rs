//! The per-connection protocol state machine together with the session
//! lifecycle that owns it.
//!
//! States: Greeting -> MethodSelected -> (AuthSubnegotiate)? -> Request ->
//! CommandDispatch -> (ConnectInProgress | UdpAssociateRelay) -> TcpRelay |
//! UdpRelay -> Closed.
//!
//! One method per wire step (greeting, auth, request, dispatch, relay)
//! drives a single `async fn` over an explicit `SessionState` enum rather
//! than one type per state: a tagged variant over states is preferable
//! here since every transition is a single I/O completion away from the
//! next.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;

use crate::{
    addr::{decode_host, encode_endpoint, fixed_addr_len},
    config::Config,
    deadline::DeadlineGuard,
    error::{
        AuthFailedSnafu, Error, ProtocolViolationSnafu, UnsupportedAddressTypeSnafu, UnsupportedCommandSnafu,
        UnsupportedMethodSnafu,
    },
    info,
    io::relay,
    resolver::{resolve_or_unreachable, Resolver},
    types::{AddrType, Command, Host, Method, ReplyCode, TargetAddr},
    udp::UdpAssociation,
    warn,
};

const SOCKS_VERSION: u8 = 0x05;

/// Coarse state labels, kept mostly for logging/observability; the actual
/// driving logic is a straight-line `async fn`, since every transition is a
/// single I/O completion away from the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Greeting,
    MethodSelected,
    AuthSubnegotiate,
    Request,
    CommandDispatch,
    TcpRelay,
    UdpRelay,
    Closed,
}

/// One accepted client connection, pinned to the reactor it was created on.
pub struct Session<R: Resolver> {
    client: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<Config>,
    resolver: Arc<R>,
    deadline: DeadlineGuard,
    token: CancellationToken,
    state: SessionState,
}

impl<R: Resolver> Session<R> {
    pub fn new(client: TcpStream, peer_addr: SocketAddr, config: Arc<Config>, resolver: Arc<R>) -> Self {
        let token = CancellationToken::new();
        let deadline = DeadlineGuard::new(config.idle_timeout, token.clone());
        Self {
            client,
            peer_addr,
            config,
            resolver,
            deadline,
            token,
            state: SessionState::Greeting,
        }
    }

    /// Runs the session to completion. Every error is confined here: the
    /// acceptor never sees it.
    pub async fn run(mut self) {
        let deadline_task = tokio::spawn(self.deadline.clone().watch());
        let token = self.token.clone();

        let result = tokio::select! {
            res = self.drive() => res,
            _ = token.cancelled() => Err(crate::error::TimeoutSnafu.build()),
        };

        self.token.cancel();
        deadline_task.abort();

        if let Err(err) = result
            && !err.is_quiet()
        {
            warn!(target: "[SESSION]", "{} closed in {:?}: {err}", self.peer_addr, self.state);
        } else {
            info!(target: "[SESSION]", "{} closed in {:?}", self.peer_addr, self.state);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn drive(&mut self) -> Result<(), Error> {
        let method = self.greeting().await?;
        self.state = SessionState::MethodSelected;

        if method == Method::UserPassword {
            self.state = SessionState::AuthSubnegotiate;
            self.authenticate().await?;
        }

        self.state = SessionState::Request;
        let (cmd, target) = self.read_request().await?;
        self.deadline.renew();

        self.state = SessionState::CommandDispatch;
        match cmd {
            Command::Connect => self.handle_connect(target).await,
            Command::UdpAssociate => self.handle_udp_associate(target).await,
            Command::Bind | Command::Other(_) => {
                self.reply(ReplyCode::CommandNotSupported, None).await?;
                UnsupportedCommandSnafu.fail()
            }
        }
    }

    /// Reads `VER(1) NMETHODS(1) METHODS(NMETHODS)`, writes `VER(1)
    /// METHOD(1)`. Picks the first client-offered method present in
    /// the configured acceptable set, or `NoAcceptable` if none match.
    async fn greeting(&mut self) -> Result<Method, Error> {
        let mut head = [0u8; 2];
        self.client.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return ProtocolViolationSnafu {
                reason: format!("unexpected VER {:#04x} in greeting", head[0]),
            }
            .fail();
        }
        let nmethods = head[1] as usize;
        let mut methods = vec![0u8; nmethods];
        self.client.read_exact(&mut methods).await?;
        self.deadline.renew();

        let chosen = methods
            .iter()
            .map(|&m| Method::from(m))
            .find(|m| self.config.accepts(*m))
            .unwrap_or(Method::NoAcceptable);

        self.client.write_all(&[SOCKS_VERSION, chosen.into()]).await?;
        self.deadline.renew();

        if chosen == Method::NoAcceptable {
            return UnsupportedMethodSnafu.fail();
        }
        Ok(chosen)
    }

    /// RFC 1929 username/password subnegotiation.
    async fn authenticate(&mut self) -> Result<(), Error> {
        let mut head = [0u8; 2];
        self.client.read_exact(&mut head).await?;
        let ulen = head[1] as usize;
        let mut uname = vec![0u8; ulen];
        self.client.read_exact(&mut uname).await?;

        let mut plen_buf = [0u8; 1];
        self.client.read_exact(&mut plen_buf).await?;
        let mut passwd = vec![0u8; plen_buf[0] as usize];
        self.client.read_exact(&mut passwd).await?;
        self.deadline.renew();

        let creds = self.config.credentials.as_ref();
        let ok = creds.is_some_and(|c| c.username.as_bytes() == uname && c.password.as_bytes() == passwd);

        self.client.write_all(&[0x01, if ok { 0x00 } else { 0xFF }]).await?;
        self.deadline.renew();

        if ok {
            Ok(())
        } else {
            AuthFailedSnafu.fail()
        }
    }

    /// Reads `VER CMD RSV ATYP DST.ADDR DST.PORT`. `RSV` is read but not
    /// validated.
    async fn read_request(&mut self) -> Result<(Command, TargetAddr), Error> {
        let mut head = [0u8; 4];
        self.client.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return ProtocolViolationSnafu {
                reason: format!("unexpected VER {:#04x} in request", head[0]),
            }
            .fail();
        }
        let cmd = Command::from(head[1]);
        let atyp = head[3];

        let target = match self.read_target_addr(atyp).await {
            Ok(t) => t,
            Err(_) => {
                self.reply(ReplyCode::AddrTypeNotSupported, None).await?;
                return UnsupportedAddressTypeSnafu.fail();
            }
        };

        Ok((cmd, target))
    }

    /// Reads `DST.ADDR DST.PORT` given an already-read ATYP byte, using the
    /// address codec's pure decode functions for the byte-level parsing.
    async fn read_target_addr(&mut self, atyp: u8) -> Result<TargetAddr, Error> {
        let host = if let Some(len) = fixed_addr_len(AddrType::from(atyp)) {
            let mut addr_buf = [0u8; 16];
            self.client.read_exact(&mut addr_buf[..len]).await?;
            decode_host(atyp, &addr_buf[..len])?
        } else if AddrType::from(atyp) == AddrType::Domain {
            let mut len_buf = [0u8; 1];
            self.client.read_exact(&mut len_buf).await?;
            let len = len_buf[0] as usize;
            let mut name_buf = vec![0u8; len];
            self.client.read_exact(&mut name_buf).await?;
            Host::Domain(String::from_utf8(name_buf).map_err(|_| UnsupportedAddressTypeSnafu.build())?)
        } else {
            return UnsupportedAddressTypeSnafu.fail();
        };

        let mut port_buf = [0u8; 2];
        self.client.read_exact(&mut port_buf).await?;
        Ok(TargetAddr::new(host, u16::from_be_bytes(port_buf)))
    }

    /// CONNECT: resolve (if domain), dial each candidate in order,
    /// reply with the bound local endpoint, then relay.
    async fn handle_connect(&mut self, target: TargetAddr) -> Result<(), Error> {
        let candidates = match self.candidates(&target).await {
            Ok(v) => v,
            Err(err) => {
                let rep = err.to_reply_code().unwrap_or(ReplyCode::HostUnreachable);
                self.reply(rep, None).await?;
                return Err(err);
            }
        };

        let mut last_err = None;
        let mut upstream = None;
        for addr in candidates {
            match TcpStream::connect(addr).await {
                Ok(sock) => {
                    upstream = Some(sock);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }

        let Some(mut upstream) = upstream else {
            if let Some(err) = last_err {
                warn!(target: "[TCP]", "{} connect failed: {err}", self.peer_addr);
            }
            self.reply(ReplyCode::NetworkUnreachable, None).await?;
            return crate::error::NetworkUnreachableSnafu.fail();
        };

        let bound = match upstream.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                self.reply(ReplyCode::ConnRefused, None).await?;
                return Err(Error::from(err));
            }
        };

        self.reply(ReplyCode::Succeeded, Some(bound)).await?;
        self.state = SessionState::TcpRelay;
        info!(target: "[TCP]", "{} -> {bound} relaying", self.peer_addr);

        relay(&mut self.client, &mut upstream, &self.deadline).await;
        Ok(())
    }

    /// UDP ASSOCIATE: bind the relay socket, reply, then keep the
    /// controlling TCP connection open while the relay runs; either side
    /// closing ends the association.
    async fn handle_udp_associate(&mut self, target: TargetAddr) -> Result<(), Error> {
        let client_tcp_local = self.client.local_addr()?;
        let assoc = UdpAssociation::bind(
            client_tcp_local,
            &target,
            self.resolver.clone(),
            self.deadline.clone(),
            self.token.clone(),
        )
        .await?;

        let bound = assoc.local_addr();
        self.reply(ReplyCode::Succeeded, Some(bound)).await?;
        self.state = SessionState::UdpRelay;
        info!(target: "[UDP]", "{} associated, relay on {bound}", self.peer_addr);

        let assoc = Arc::new(assoc);
        let relay_task = tokio::spawn(assoc.run());

        // The UDP association lives only as long as the controlling TCP
        // stream stays open; any byte or EOF on it ends the relay.
        let mut sink = [0u8; 256];
        loop {
            tokio::select! {
                res = self.client.read(&mut sink) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(_) => self.deadline.renew(),
                },
                _ = self.token.cancelled() => break,
            }
        }

        self.token.cancel();
        relay_task.abort();
        Ok(())
    }

    /// Resolves a domain target through the facade, or returns the literal
    /// endpoint directly — the same ordered-candidate list CONNECT and UDP
    /// ASSOCIATE both consume.
    async fn candidates(&self, target: &TargetAddr) -> Result<Vec<SocketAddr>, Error> {
        match &target.host {
            Host::Domain(name) => resolve_or_unreachable(&*self.resolver, name, target.port).await,
            _ => Ok(vec![SocketAddr::try_from(target).expect("literal host converts")]),
        }
    }

    /// Writes `VER REP RSV ATYP BND.ADDR BND.PORT`. `bound` is `None` for
    /// error replies that never opened an upstream, which reply with the
    /// all-zeros IPv4 endpoint.
    async fn reply(&mut self, rep: ReplyCode, bound: Option<SocketAddr>) -> Result<(), Error> {
        let mut buf = BytesMut::with_capacity(22);
        buf.extend_from_slice(&[SOCKS_VERSION, rep.into(), 0x00]);
        match bound {
            Some(addr) => {
                encode_endpoint(addr, &mut buf);
            }
            None => {
                buf.extend_from_slice(&[AddrType::V4.into(), 0, 0, 0, 0, 0, 0]);
            }
        }
        self.client.write_all(&buf).await?;
        self.deadline.renew();
        Ok(())
    }
}

/// Seconds-based idle timeout as configured, converted once at `Config`
/// construction time; kept here only to document the `0 disables` rule
/// the `0 disables` rule for the `timeout` key.
pub fn idle_timeout_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 { None } else { Some(Duration::from_secs(secs)) }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::config::Credentials;

    struct NoopResolver;
    impl Resolver for NoopResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<SocketAddr>> {
            Ok(vec![])
        }
    }

    fn no_auth_config() -> Arc<Config> {
        Arc::new(Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            worker_count: 1,
            idle_timeout: None,
            methods: HashSet::from([Method::NoAuth]),
            credentials: None,
        })
    }

    #[tokio::test]
    async fn no_acceptable_method_replies_ff_and_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            let session = Session::new(sock, peer, no_auth_config(), Arc::new(NoopResolver));
            session.run().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0xFF]);

        let mut trailing = [0u8; 1];
        assert_eq!(client.read(&mut trailing).await.unwrap(), 0);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn bind_command_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            let session = Session::new(sock, peer, no_auth_config(), Arc::new(NoopResolver));
            session.run().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn user_password_success_then_connect() {
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = upstream_listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).await.unwrap();
            sock.write_all(&buf).await.unwrap();
        });

        let config = Arc::new(Config {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            worker_count: 1,
            idle_timeout: None,
            methods: HashSet::from([Method::UserPassword]),
            credentials: Some(Credentials {
                username: "user".into(),
                password: "pass".into(),
            }),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (sock, peer) = listener.accept().await.unwrap();
            Session::new(sock, peer, config, Arc::new(NoopResolver)).run().await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut method_reply = [0u8; 2];
        client.read_exact(&mut method_reply).await.unwrap();
        assert_eq!(method_reply, [0x05, 0x02]);

        let mut auth = vec![0x01, 4];
        auth.extend_from_slice(b"user");
        auth.push(4);
        auth.extend_from_slice(b"pass");
        client.write_all(&auth).await.unwrap();
        let mut auth_reply = [0u8; 2];
        client.read_exact(&mut auth_reply).await.unwrap();
        assert_eq!(auth_reply, [0x01, 0x00]);

        let mut req = vec![0x05, 0x01, 0x00, 0x01];
        req.extend_from_slice(&[127, 0, 0, 1]);
        req.extend_from_slice(&upstream_addr.port().to_be_bytes());
        client.write_all(&req).await.unwrap();

        let mut reply_head = [0u8; 4];
        client.read_exact(&mut reply_head).await.unwrap();
        assert_eq!(&reply_head[..2], &[0x05, 0x00]);

        client.write_all(b"ahoy!").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ahoy!");

        drop(client);
        server.await.unwrap();
    }
}

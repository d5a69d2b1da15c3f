//! The TCP acceptor: one bound listener, round-robin reactor dispatch per
//! connection.
//!
//! Each accept hands the new socket to the next reactor in the pool and
//! immediately loops to accept again; `SO_REUSEADDR` is set via `socket2`
//! before the raw socket is handed to tokio.

use std::{net::SocketAddr, sync::Arc};

use tokio_util::sync::CancellationToken;

use crate::{config::Config, reactor::ReactorPool, resolver::Resolver, session::Session, warn};

/// Owns the listening socket and the loop that hands accepted connections
/// off to the reactor pool.
pub struct Acceptor {
    listener: tokio::net::TcpListener,
    local_addr: SocketAddr,
}

impl Acceptor {
    /// Binds `addr` with `SO_REUSEADDR` set, matching the original
    /// `socks5_server`'s listener construction.
    pub fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = tokio::net::TcpListener::from_std(socket.into())?;
        let local_addr = listener.local_addr()?;
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` is cancelled. Each accepted
    /// socket is handed, as a fresh `Session`, to the next reactor in
    /// round-robin order and never touched again on this task — per
    /// one accept failure never stops the loop.
    pub async fn run<R: Resolver>(
        self,
        pool: Arc<ReactorPool>,
        config: Arc<Config>,
        resolver: Arc<R>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = self.listener.accept() => res,
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => v,
                Err(err) => {
                    warn!(target: "[ACCEPT]", "accept failed: {err}");
                    continue;
                }
            };

            let handle = pool.acquire();
            let config = config.clone();
            let resolver = resolver.clone();
            handle.spawn(async move {
                let session = Session::new(stream, peer_addr, config, resolver);
                session.run().await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use super::*;
    use crate::types::Method;

    struct NoopResolver;
    impl Resolver for NoopResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> std::io::Result<Vec<SocketAddr>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn accepts_and_dispatches_to_a_reactor() {
        let acceptor = Acceptor::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = acceptor.local_addr();

        let pool = Arc::new(ReactorPool::new(1).unwrap());
        let config = Arc::new(Config {
            listen_addr: addr,
            worker_count: 1,
            idle_timeout: None,
            methods: HashSet::from([Method::NoAuth]),
            credentials: None,
        });
        let shutdown = CancellationToken::new();

        let server_shutdown = shutdown.clone();
        let server = tokio::spawn(acceptor.run(pool, config, Arc::new(NoopResolver), server_shutdown));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        shutdown.cancel();
        server.await.unwrap();
    }
}

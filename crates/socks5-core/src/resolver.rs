//! The resolver facade: the core only ever consumes a
//! `resolve(host, port) -> ordered list of endpoints` interface. The
//! concrete DNS resolver is an external collaborator supplied by the
//! binary crate.

use std::net::SocketAddr;

use crate::error::{Error, HostUnreachableSnafu};

/// Resolves a domain name to an ordered list of candidate endpoints.
///
/// Implementations are free to race, cache, or otherwise optimize; the core
/// only requires that an empty result be treated as failure and that
/// callers be free to try the candidates in the returned order.
pub trait Resolver: Send + Sync + 'static {
    fn resolve(&self, host: &str, port: u16) -> impl Future<Output = std::io::Result<Vec<SocketAddr>>> + Send;
}

/// Resolves via the facade and converts an empty or failed lookup into
/// `Error::HostUnreachable`.
pub async fn resolve_or_unreachable<R: Resolver>(resolver: &R, host: &str, port: u16) -> Result<Vec<SocketAddr>, Error> {
    let endpoints = resolver.resolve(host, port).await.map_err(|_| HostUnreachableSnafu.build())?;
    if endpoints.is_empty() {
        return HostUnreachableSnafu.fail();
    }
    Ok(endpoints)
}

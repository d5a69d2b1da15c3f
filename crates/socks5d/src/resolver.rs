//! The concrete DNS resolver the core's facade is run against: the core
//! only consumes a `resolve(host, port) -> endpoints` interface, and this is
//! the system-resolver implementation of it, done through
//! `tokio::net::lookup_host` so resolution never blocks a reactor thread.

use std::net::SocketAddr;

use socks5_core::Resolver;

pub struct SystemResolver;

impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port)).await?;
        Ok(addrs.collect())
    }
}

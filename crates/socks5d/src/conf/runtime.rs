use std::{collections::HashSet, net::{IpAddr, SocketAddr}};

use socks5_core::{
    config::Credentials,
    session::idle_timeout_from_secs,
    types::Method,
    Config,
};

use super::persistent::PersistentConfig;

/// Resolves the on-disk shape into the value `socks5_core::Config`
/// actually runs against: resolves `server.host`/`server.port` into one
/// listen `SocketAddr` (accepting a literal IPv4/IPv6 address or a
/// hostname), `supported-methods` into a `HashSet<Method>`, and `timeout`
/// into the `0 disables` `Option<Duration>` the core expects.
pub async fn into_runtime_config(persisted: PersistentConfig) -> eyre::Result<Config> {
    let listen_addr: SocketAddr = match persisted.server.host.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::from((ip, persisted.server.port)),
        Err(_) => tokio::net::lookup_host((persisted.server.host.as_str(), persisted.server.port))
            .await?
            .next()
            .ok_or_else(|| eyre::eyre!("could not resolve listen address {}", persisted.server.host))?,
    };

    let methods: HashSet<Method> = persisted.supported_methods.iter().map(|&m| Method::from(m)).collect();

    let credentials = persisted.auth.map(|auth| Credentials {
        username: auth.username,
        password: auth.password,
    });

    if methods.contains(&Method::UserPassword) && credentials.is_none() {
        return Err(eyre::eyre!(
            "supported-methods includes UserPassword (0x02) but no [auth] section was provided"
        ));
    }

    Ok(Config {
        listen_addr,
        worker_count: persisted.server.thread_num.max(1),
        idle_timeout: idle_timeout_from_secs(persisted.timeout),
        methods,
        credentials,
    })
}

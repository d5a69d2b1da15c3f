use std::sync::Arc;

use clap::Parser as _;
use socks5_core::{acceptor::Acceptor, info, reactor::ReactorPool};
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::cli::{Cli, Commands, ConfigFormat};

mod cli;
mod conf;
mod log;
mod resolver;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = match Cli::try_parse() {
        Ok(v) => v,
        Err(err) => {
            println!("{err:#}");
            return Ok(());
        }
    };

    if cli.version {
        println!("socks5d {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    if let Some(Commands::Init { output, format }) = cli.command {
        let format = match format {
            ConfigFormat::Yaml => "yaml",
            ConfigFormat::Toml => "toml",
        };
        conf::persistent::PersistentConfig::default().export_to_file(&output, format)?;
        println!("wrote default configuration to {}", output.display());
        return Ok(());
    }

    let persisted = conf::persistent::PersistentConfig::load(cli.config, cli.config_dir)?;
    let log_level = persisted.log.level.parse().unwrap_or(Level::INFO);
    log::init_log(log_level)?;
    info!(target: "[MAIN]", "socks5d starting");

    let config = Arc::new(conf::runtime::into_runtime_config(persisted).await?);

    let pool = Arc::new(ReactorPool::new(config.worker_count)?);
    let acceptor = Acceptor::bind(config.listen_addr)?;
    info!(target: "[MAIN]", "listening on {}", acceptor.local_addr());

    let shutdown = CancellationToken::new();
    let resolver = Arc::new(resolver::SystemResolver);

    let accept_shutdown = shutdown.clone();
    let accept_pool = pool.clone();
    let accept_config = config.clone();
    let accept_task = tokio::spawn(acceptor.run(accept_pool, accept_config, resolver, accept_shutdown));

    wait_for_shutdown_signal().await;
    info!(target: "[MAIN]", "shutdown signal received, draining");

    shutdown.cancel();
    let _ = accept_task.await;

    Ok(())
}

/// Registers SIGINT, SIGTERM, and (on platforms that support it) SIGQUIT,
/// returning as soon as any one of them fires.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("failed to register SIGQUIT handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
        _ = sigquit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

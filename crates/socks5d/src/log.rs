use time::macros::format_description;
use tracing::{level_filters::LevelFilter, Level};
use tracing_subscriber::{fmt::time::LocalTime, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Initializes the global `tracing` subscriber. Both crates of this
/// workspace emit through the `info!`/`warn!`/`error!`/`debug!` macros in
/// `socks5_core::log`, which prefix every record's target with the
/// emitting crate's name; `Targets` below is keyed on those same names.
pub fn init_log(level: Level) -> eyre::Result<()> {
    let filter = tracing_subscriber::filter::Targets::new()
        .with_targets(vec![("socks5_core", level), ("socks5d", level)])
        .with_default(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer().with_target(true).with_timer(LocalTime::new(format_description!(
                "[year repr:last_two]-[month]-[day] [hour]:[minute]:[second]"
            ))),
        )
        .try_init()?;

    Ok(())
}

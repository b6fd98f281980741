use clap::Values;
use color_eyre::eyre::eyre;
use color_eyre::Report;
use netblast::net::Network;
use std::fmt::Display;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Routes human-readable logs to stderr so that stdout stays
/// machine-readable (`FLOW:` lines and the manager address).
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn parse_or<T>(value: Option<&str>, default: T) -> Result<T, Report>
where
    T: FromStr,
    T::Err: Display,
{
    match value {
        Some(value) => value
            .parse()
            .map_err(|e| eyre!("invalid value {:?}: {}", value, e)),
        None => Ok(default),
    }
}

#[allow(dead_code)]
pub fn parse_networks(
    values: Option<Values<'_>>,
) -> Result<Vec<Network>, Report> {
    match values {
        Some(values) => values.map(str::parse).collect(),
        None => Ok(Vec::new()),
    }
}

mod common;

use clap::{App, Arg};
use color_eyre::eyre::eyre;
use color_eyre::Report;
use netblast::config::WorkerConfig;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let config = parse_args()?;
    common::init_logging(config.debug);
    netblast::worker::run(config).await
}

fn parse_args() -> Result<WorkerConfig, Report> {
    let matches = App::new("netblast-worker")
        .version("0.1")
        .about("Connect to a netblast manager and do assigned tasks.")
        .arg(
            Arg::with_name("manager")
                .long("manager")
                .value_name("HOSTNAME:PORT")
                .help("address of netblast manager")
                .required(true)
                .takes_value(true),
        )
        .arg(
            Arg::with_name("worker-port")
                .long("worker-port")
                .value_name("PORT")
                .help("network port to listen on (default use random port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("worker-host")
                .long("worker-host")
                .value_name("HOST")
                .help("IP/hostname to bind to (default all interfaces)")
                .takes_value(true),
        )
        .arg(Arg::with_name("debug").long("debug").help("enable debug logging"))
        .arg(
            Arg::with_name("duration")
                .long("duration")
                .value_name("SECONDS")
                .help("stop the worker after this many seconds")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("daemonize")
                .long("daemonize")
                .help("accepted for compatibility; the worker stays in the foreground"),
        )
        .get_matches();

    let duration = matches
        .value_of("duration")
        .map(str::parse)
        .transpose()
        .map_err(|e| eyre!("invalid duration: {}", e))?;

    Ok(WorkerConfig {
        manager: matches
            .value_of("manager")
            .expect("--manager is required")
            .to_string(),
        worker_host: matches.value_of("worker-host").unwrap_or("").to_string(),
        worker_port: common::parse_or(matches.value_of("worker-port"), 0)?,
        debug: matches.is_present("debug"),
        duration,
        daemonize: matches.is_present("daemonize"),
    })
}

mod common;

use clap::{App, Arg};
use color_eyre::eyre::eyre;
use color_eyre::Report;
use netblast::config::{ManagerConfig, TEST_DURATION};
use netblast::manager::Server;

#[tokio::main]
async fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let config = parse_args()?;
    common::init_logging(config.debug);
    let server = Server::bind(config).await?;
    server.run().await
}

fn parse_args() -> Result<ManagerConfig, Report> {
    let matches = App::new("netblast-manager")
        .version("0.1")
        .about("Manage a swarm of netblast workers.")
        .arg(
            Arg::with_name("port")
                .long("port")
                .value_name("PORT")
                .help("network port to use (default use random port)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("IP/hostname to bind to (default all interfaces)")
                .takes_value(true),
        )
        .arg(Arg::with_name("debug").long("debug").help("enable debug logging"))
        .arg(
            Arg::with_name("duration")
                .long("duration")
                .value_name("SECONDS")
                .help("stop the test after this many seconds (0 runs until signalled)")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("src")
                .long("src")
                .value_name("NETWORK")
                .help("network(s) that should send data")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("dest")
                .long("dest")
                .value_name("NETWORK")
                .help("network(s) that should receive data")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("direction")
                .long("direction")
                .value_name("DIRECTION")
                .help("direction of flow from 'src' to 'dest': (s)end, (r)eceive, (b)oth")
                .possible_values(&["s", "r", "b"])
                .default_value("s")
                .takes_value(true),
        )
        .get_matches();

    Ok(ManagerConfig {
        host: matches.value_of("host").unwrap_or("").to_string(),
        port: common::parse_or(matches.value_of("port"), 0)?,
        debug: matches.is_present("debug"),
        duration: common::parse_or(matches.value_of("duration"), TEST_DURATION)?,
        src_networks: common::parse_networks(matches.values_of("src"))?,
        dest_networks: common::parse_networks(matches.values_of("dest"))?,
        direction: matches
            .value_of("direction")
            .unwrap_or("s")
            .parse()
            .map_err(|e| eyre!("{}", e))?,
    })
}

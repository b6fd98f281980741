mod common;

use clap::{App, Arg};
use color_eyre::Report;
use netblast::config::AnalyzeConfig;
use std::path::PathBuf;

fn main() -> Result<(), Report> {
    color_eyre::install()?;
    let config = parse_args()?;
    common::init_logging(config.debug);
    netblast::analyze::run(&config)
}

fn parse_args() -> Result<AnalyzeConfig, Report> {
    let matches = App::new("netblast-analyze")
        .version("0.1")
        .about("Analyze the log of a netblast manager to summarize network flows.")
        .arg(Arg::with_name("debug").long("debug").help("enable debug logging"))
        .arg(
            Arg::with_name("src")
                .long("src")
                .value_name("NETWORK")
                .help("filter by IP address of source")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("dest")
                .long("dest")
                .value_name("NETWORK")
                .help("filter by IP address of destination")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1),
        )
        .arg(
            Arg::with_name("dt")
                .long("dt")
                .value_name("SECONDS")
                .help("time delta between output records")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("logfile")
                .value_name("LOGFILE")
                .help("netblast manager log to read")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::with_name("outputcsv")
                .value_name("OUTPUTCSV")
                .help("CSV file to write")
                .required(true)
                .index(2),
        )
        .get_matches();

    Ok(AnalyzeConfig {
        logfile: PathBuf::from(
            matches.value_of("logfile").expect("logfile is required"),
        ),
        outputcsv: PathBuf::from(
            matches.value_of("outputcsv").expect("outputcsv is required"),
        ),
        debug: matches.is_present("debug"),
        src: common::parse_networks(matches.values_of("src"))?,
        dest: common::parse_networks(matches.values_of("dest"))?,
        dt: common::parse_or(matches.value_of("dt"), 30)?,
    })
}

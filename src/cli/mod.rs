pub mod actions;
pub mod config;

use clap::{Arg, ArgMatches, Command};

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

pub fn build_command() -> Command {
    Command::new("stationlink")
        .about("Station handshake engine for S7 and Modbus production lines")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Configuration file (.toml or .json)")
                .value_name("FILE")
                .default_value("stationlink.toml"),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .help("Validate the configuration and exit")
                .action(clap::ArgAction::SetTrue)
                .conflicts_with("probe"),
        )
        .arg(
            Arg::new("probe")
                .long("probe")
                .help("Read every station's handshake bits and serial once, without writing, and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("station")
                .long("station")
                .short('s')
                .help("Only run or probe the given station id (repeatable)")
                .value_name("ID")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .short('j')
                .help("Output one-shot results in JSON format")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .help("Also write logs to this file")
                .value_name("FILE"),
        )
}

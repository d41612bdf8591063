//! Command-line arguments and daemon configuration.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};

/// Object-tree path of the background-scan toggle.
pub const SETTING_AUTO_SCAN: &str = "Settings/Redflow/AutoScan";

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    Command::new("redflow-bridge")
        .about("Bridges Redflow ZBM batteries from Modbus RTU onto the object bus")
        .arg(
            Arg::new("port")
                .help("Serial device connected to the battery bus (e.g. /dev/ttyUSB0)")
                .required_unless_present("list-ports"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .short('b')
                .help("Serial baud rate")
                .value_parser(clap::value_parser!(u32))
                .default_value("19200"),
        )
        .arg(
            Arg::new("no-autoscan")
                .long("no-autoscan")
                .help("Start with background device scanning disabled")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("status-dump")
                .long("status-dump")
                .value_name("PATH")
                .help("Write a JSON status snapshot to PATH once per second"),
        )
        .arg(
            Arg::new("list-ports")
                .long("list-ports")
                .short('l')
                .help("List all available serial ports and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: String,
    pub baud_rate: u32,
    pub autoscan: bool,
    pub status_dump: Option<PathBuf>,
}

impl Config {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let port = matches
            .get_one::<String>("port")
            .ok_or_else(|| anyhow!("a serial port is required"))?
            .clone();
        Ok(Self {
            port,
            baud_rate: *matches.get_one::<u32>("baud-rate").unwrap_or(&19200),
            autoscan: !matches.get_flag("no-autoscan"),
            status_dump: matches.get_one::<String>("status-dump").map(PathBuf::from),
        })
    }
}

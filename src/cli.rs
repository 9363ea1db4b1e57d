//! Command-line and config-file option handling.
//!
//! The core library doesn't need a CLI -- a caller can build a
//! [`crate::server::ServerConfig`] directly -- but the reference binary
//! (`main.rs`) exposes one: a `clap` builder with flags for the listening
//! address (`--node`, `--unixsock`), role (`--server`), connection cap
//! (`--maxclients`) and logging (`--verbose`, `--logfile`).

use std::fs;
use std::process;

use clap::{App, Arg};

use crate::handler::{parse_key_value, ParseOutcome};

#[derive(Debug, Clone)]
pub struct ProgramOptions {
    /// `host:port`, `:port` or `port` for an INET server/client.
    pub node: Option<String>,
    /// Run as server (true) or connect as a client (false).
    pub server: bool,
    /// UNIX domain socket path; mutually exclusive with `node`.
    pub unixsock: Option<String>,
    pub maxclients: usize,
    pub verbose: bool,
    pub logfile: Option<String>,
}

impl Default for ProgramOptions {
    fn default() -> ProgramOptions {
        ProgramOptions {
            node: None,
            server: false,
            unixsock: None,
            maxclients: 32,
            verbose: false,
            logfile: None,
        }
    }
}

fn build_parser<'a, 'b>() -> App<'a, 'b> {
    App::new("kvsockd")
        .version("0.1.0")
        .about("Key/value command server over UNIX or INET sockets")
        .arg(
            Arg::with_name("node")
                .long("node")
                .value_name("ADDR")
                .help("INET address: \":port\", \"host:port\" or \"port\"")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("server")
                .long("server")
                .help("Run as a server rather than a client"),
        )
        .arg(
            Arg::with_name("unixsock")
                .long("unixsock")
                .value_name("PATH")
                .help("UNIX domain socket path (literal, or \\0name for abstract)")
                .takes_value(true)
                .conflicts_with("node"),
        )
        .arg(
            Arg::with_name("maxclients")
                .long("maxclients")
                .value_name("N")
                .help("Maximum simultaneously connected clients")
                .takes_value(true)
                .default_value("32"),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug-level logging"),
        )
        .arg(
            Arg::with_name("logfile")
                .long("logfile")
                .value_name("PATH")
                .help("File to log to (stderr if omitted)")
                .takes_value(true),
        )
}

/// Parses `std::env::args()`, optionally prefixed with synthetic
/// `--key=value` tokens read from a config file (see
/// [`config_file_args`]). Exits the process with status `-1` on a bad
/// `--maxclients` value rather than panicking.
pub fn parse_args(config_path: Option<&str>) -> ProgramOptions {
    let mut argv: Vec<String> = vec!["kvsockd".to_string()];
    if let Some(path) = config_path {
        argv.extend(config_file_args(path));
    }
    argv.extend(std::env::args().skip(1));

    let parser = build_parser().get_matches_from(argv);

    let mut options = ProgramOptions::default();
    options.node = parser.value_of("node").map(str::to_string);
    options.server = parser.is_present("server");
    options.unixsock = parser.value_of("unixsock").map(str::to_string);
    options.verbose = parser.is_present("verbose");
    options.logfile = parser.value_of("logfile").map(str::to_string);
    if let Some(n) = parser.value_of("maxclients") {
        match n.parse::<usize>() {
            Ok(v) => options.maxclients = v,
            Err(_) => {
                eprintln!("The value of --maxclients must be a positive integer");
                process::exit(-1);
            }
        }
    }
    options
}

/// Reads a `key = value` config file (same syntax the command parser
/// accepts on the wire) and synthesizes `--key=value` / `--key` argv
/// tokens from it, ahead of the real process arguments. Lines that
/// don't yield a key are skipped; unreadable files yield no tokens.
pub fn config_file_args(path: &str) -> Vec<String> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let mut tokens = Vec::new();
    for line in contents.lines() {
        match parse_key_value(line) {
            ParseOutcome::NoKey => continue,
            ParseOutcome::KeyOnly(key) => tokens.push(format!("--{}", key)),
            ParseOutcome::KeyValue(key, value) => tokens.push(format!("--{}={}", key, value)),
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_no_address_and_client_role() {
        let opts = ProgramOptions::default();
        assert!(!opts.server);
        assert_eq!(opts.maxclients, 32);
    }

    #[test]
    fn missing_config_file_yields_no_tokens() {
        assert!(config_file_args("/nonexistent/path/kvsockd.conf").is_empty());
    }
}

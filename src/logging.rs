//! Thin wrapper over `simple_logging` + `log`: one call sets up either
//! file or stderr logging at the chosen verbosity.

use log::LevelFilter;

/// Initialises logging to `path` if given, otherwise to stderr.
/// `verbose` selects `Debug` over `Info` as the minimum level.
pub fn init(path: Option<&str>, verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let result = match path {
        Some(path) => simple_logging::log_to_file(path, level),
        None => simple_logging::log_to_stderr(level),
    };
    if let Err(e) = result {
        eprintln!("failed to initialise logging: {}", e);
    }
}

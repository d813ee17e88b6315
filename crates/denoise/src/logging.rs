// Logging — fmt subscriber for the denoise tracing events
//
// Library crates only emit events (targets denoise, denoise::cpu,
// denoise::cuda); installing a subscriber is left to the application, and
// init() is the quick way to do it from a DeviceConfig verbosity.

use tracing::Level;

/// Maximum level for a verbosity: 0 warn, 1 info, 2 debug, 3+ trace.
pub fn level_for(verbose: u32) -> Level {
    match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Install a global fmt subscriber writing to stderr.
///
/// Returns false if a global subscriber was already installed.
pub fn init(verbose: u32) -> bool {
    tracing_subscriber::fmt()
        .with_max_level(level_for(verbose))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

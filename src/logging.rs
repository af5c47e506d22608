//! Tracing subscriber setup for hosts embedding the engine

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber writing to stderr.
///
/// `RUST_LOG` wins over `default_directive` (e.g. `"info"` or
/// `"simgraph=debug"`). Returns `false` when a subscriber was already
/// installed, so calling it more than once is harmless.
pub fn init_tracing(default_directive: &str) -> bool {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .is_ok()
}

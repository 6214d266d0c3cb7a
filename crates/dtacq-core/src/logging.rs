//! Tracing bootstrap for applications and tests embedding the driver.
//!
//! Library code only emits events through `tracing`; installing a subscriber
//! is left to the host. [`init_tracing`] is the default choice: a fmt layer on
//! stderr filtered by `RUST_LOG`, falling back to the given directive.

use tracing_subscriber::EnvFilter;

/// Install a global fmt subscriber. Does nothing if one is already set.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_thread_names(true)
        .try_init();
}

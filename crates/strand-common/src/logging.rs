use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable read for the log filter.
pub const LOG_ENV: &str = "STRAND_LOG";

/// Initialize structured logging with environment filter.
/// Set STRAND_LOG=debug (or trace, info, warn, error) for verbosity control.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Like [`init_logging`], but tolerates a subscriber already being installed.
/// Integration tests call this from every test function.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_ids(true)
        .try_init();
}

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "CREDILOCKER_LOG";

/// stdout carries the IPC stream, so all log output goes to stderr.
pub fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

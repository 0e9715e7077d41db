use crate::config::Config;
use tracing_subscriber::EnvFilter;

/// Initializes the process-wide `tracing` subscriber, using `config.log_level`
/// as the default filter directive unless `RUST_LOG` is set in the
/// environment (which always wins, per `EnvFilter`'s own precedence). Called
/// once from the CLI entry point before anything else logs.
pub fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Backoff schedule shared by the remote client's update retry and the
/// queue worker's failed-item retry: a fixed delay per attempt rather than
/// exponential, since `RetryConfig::backoff_seconds` is operator-tunable
/// and the number of attempts is already small.
pub fn backoff_delay(config: &crate::config::RetryConfig, attempt: u32) -> std::time::Duration {
    let seconds = config.backoff_seconds.saturating_mul(attempt.max(1) as u64);
    std::time::Duration::from_secs(seconds)
}

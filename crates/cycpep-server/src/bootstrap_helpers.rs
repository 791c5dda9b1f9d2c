use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

const LOG_FILTER_ENV: &str = "CYCPEP_LOG";

/// Installs the global subscriber, filtered by `CYCPEP_LOG` (default `warn`).
///
/// Stdout carries MCP frames, so every event is written to stderr.
pub(crate) fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .with_env_var(LOG_FILTER_ENV)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .compact()
        .init();
}

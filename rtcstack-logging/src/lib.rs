//! Structured logging setup for the RTP/RTCP transport stack

use rtcstack_config::{LogFormat, LoggingConfig};
use tracing_subscriber::{
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging according to configuration
///
/// `RUST_LOG` takes precedence over `config.level`.
pub fn init_logging(component: &str, config: &LoggingConfig) {
    match config.format {
        LogFormat::Json => init_json_logging(component, &config.level),
        LogFormat::Console => init_console_logging(component, &config.level),
    }
}

/// Initialize JSON structured logging
///
/// This sets up:
/// - JSON formatted logs (for production)
/// - Environment-based log level filtering
/// - Component name tagging
pub fn init_json_logging(component: &str, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    tracing::info!(component = component, "Logging initialized");
}

/// Initialize simple console logging (for development)
pub fn init_console_logging(component: &str, default_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!(component = component, "Console logging initialized");
}

/// Install a subscriber that writes through the test harness
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_test_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_test_writer()
        .try_init();
}

//! Structured Logging Configuration
//!
//! Provides configurable logging for services embedding the cache:
//! - JSON output for production (LOG_FORMAT=json)
//! - Human-readable output for development (default)
//! - Level filtering via RUST_LOG (default: info)
//!
//! # Usage
//!
//! ```rust,ignore
//! use lc_common::logging::init_logging;
//!
//! fn main() {
//!     init_logging("my-service");
//!     tracing::info!(cache = %name, "Cache registered");
//! }
//! ```

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Initialize logging with the given service name.
///
/// Reads LOG_FORMAT to determine output format ("json" for log
/// aggregation, anything else for human-readable text) and RUST_LOG for
/// level filtering.
pub fn init_logging(_service_name: &str) {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if log_format.eq_ignore_ascii_case("json") {
        init_json_logging(env_filter);
    } else {
        init_text_logging(env_filter);
    }
}

fn init_json_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .flatten_event(true)
                .with_span_events(FmtSpan::CLOSE),
        )
        .init();
}

fn init_text_logging(env_filter: EnvFilter) {
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(true),
        )
        .init();
}

/// Initialize logging with defaults (uses "livecache" as service name).
pub fn init_default_logging() {
    init_logging("livecache");
}

/*!
 * Tracing Setup
 * Structured logging for ordinary-context engine operations
 *
 * Signal handlers never log; their activity is visible through
 * `AtomicSuspendStats` instead.
 */

use tracing::info;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - SUSPEND_TRACE_JSON: Enable JSON output (default: false)
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("SUSPEND_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };

    if installed {
        info!(json = use_json, "Structured tracing initialized");
    }
}

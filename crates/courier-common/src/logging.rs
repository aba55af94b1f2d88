//! Logging setup and delivery correlation.
//!
//! Components log through `tracing` macros with structured fields. The
//! pipeline wraps each unit of delivery work in [`delivery_span`], so every
//! nested event carries the tracking id and user without repeating them at
//! each call site.
//!
//! `COURIER_LOG_FORMAT=json` selects JSON output for log aggregation;
//! anything else gets compact text. `RUST_LOG` filters levels (default
//! `info`).

use tracing::{info_span, Span};
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global subscriber for this process.
pub fn init_logging(service: &str) {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("COURIER_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        fmt()
            .with_env_filter(filter())
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .init();
    } else {
        fmt().with_env_filter(filter()).compact().init();
    }

    tracing::info!(service = service, json = json, "logging initialized");
}

/// Span covering one delivery's trip through the pipeline. Enter it (or
/// instrument a future with it) so retries, transport calls, and status
/// transitions all correlate on the tracking id.
pub fn delivery_span(tracking_id: &str, user_id: &str) -> Span {
    info_span!("delivery", tracking_id = %tracking_id, user_id = %user_id)
}

/// Span covering one digest sweep entry.
pub fn digest_span(user_id: &str) -> Span {
    info_span!("digest", user_id = %user_id)
}

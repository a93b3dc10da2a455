//! Structured logging bootstrap.
//!
//! Initializes `tracing-subscriber` with an env-filter honoring
//! `SCAN_LOG_LEVEL` / `RUST_LOG`, and a couple of span-building helpers used
//! by every phase transition.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Installs the global tracing subscriber. Safe to call once per process;
/// subsequent calls are no-ops (the underlying `set_global_default` error is
/// swallowed since tests may initialize more than once). `ErrorLayer`
/// attaches a `SpanTrace` to every error captured under a `scan_phase` span,
/// so `error.rs`'s diagnostics carry the phase/node context at the point of
/// failure, not just at the point the error is logged.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .finish()
        .with(ErrorLayer::default());
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Span carrying the three fields every phase-level log line is keyed on.
pub fn phase_span(scan_id: &str, phase: &str, node: &str) -> tracing::Span {
    tracing::info_span!("scan_phase", scan_id, phase, node)
}

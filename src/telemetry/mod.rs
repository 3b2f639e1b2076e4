//! Tracing and diagnostics bootstrap.
//!
//! Call [`init`] once at startup. The default filter keeps output quiet
//! (`error,servegraph=error`); set `RUST_LOG` to override, e.g.
//! `RUST_LOG=servegraph=debug` to watch envelopes walk the traversal
//! phases.

use tracing_error::ErrorLayer;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global tracing subscriber and miette's pretty panic hook.
///
/// Panics if a global subscriber is already set; use [`try_init`] when
/// embedding into a host that may have installed its own.
pub fn init() {
    install(true);
    miette::set_panic_hook();
}

/// Like [`init`] but tolerates an already-installed subscriber.
/// Returns whether this call installed ours.
pub fn try_init() -> bool {
    install(false)
}

fn install(must: bool) -> bool {
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_file(false)
        .with_line_number(false)
        // Span open/close events make instrumented async boundaries visible.
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("error,servegraph=error"))
        .unwrap_or_default();

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(ErrorLayer::default());

    if must {
        registry.init();
        true
    } else {
        registry.try_init().is_ok()
    }
}

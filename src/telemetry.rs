//! Tracing subscriber setup.

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,uar_core=debug";

/// Install the global tracing subscriber.
///
/// Configures:
/// - `tracing-subscriber::fmt` for structured, compact logging.
/// - `EnvFilter` for dynamic log levels (`RUST_LOG`), defaulting to
///   `info,uar_core=debug`.
///
/// Panics if a global subscriber is already set; use [`try_init`] from
/// tests and embedding applications.
pub fn init() {
    tracing_subscriber::registry()
        .with(filter_layer())
        .with(fmt_layer())
        .init();
}

/// Like [`init`], but reports an already-installed subscriber as an error.
///
/// # Errors
///
/// Returns an error if a global subscriber is already set.
pub fn try_init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(filter_layer())
        .with(fmt_layer())
        .try_init()
}

fn filter_layer() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

fn fmt_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .compact()
}

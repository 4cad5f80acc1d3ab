//! Tracing subscriber setup for binaries and tests embedding the engine.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into())
}

/// Install the global subscriber. `RUST_LOG` wins over `default_filter`.
///
/// # Panics
///
/// Panics if a global subscriber is already installed; use
/// [`try_init_tracing`] where that can happen.
pub fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true),
        )
        .init();
}

/// Like [`init_tracing`], returning `false` if a subscriber was already set.
pub fn try_init_tracing(default_filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(filter(default_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_test_writer()
                .with_target(true)
                .with_line_number(true),
        )
        .try_init()
        .is_ok()
}

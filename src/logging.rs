//! Tracing setup for the runner binary.
//!
//! Library code only emits `tracing` events; installing a subscriber is the
//! binary's job. Reads `RUST_LOG`, falling back to the given filter.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Output goes to stderr in compact form so
/// stdout stays free for command results.
///
/// ```bash
/// RUST_LOG=artifact_runner=debug artifact-runner run actions.json
/// ```
pub fn init(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_level(true)
                .compact(),
        )
        .init();
}

//! Development-time tracing for debugging changeguard.
//!
//! Tracing is diagnostics only: it goes to stderr, is filtered by `RUST_LOG`, and is not part
//! of the product output. The product output of `changeguard apply` is the printed outcome.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=changeguard=debug changeguard apply proposal.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}

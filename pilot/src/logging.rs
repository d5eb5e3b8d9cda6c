//! Tracing setup shared by the CLI and the server.
//!
//! # Separation of Concerns
//!
//! - **Tracing (this module)**: Diagnostics via `RUST_LOG`, output to stderr.
//!   Every run-scoped line carries the `run_id` field.
//!
//! - **Run events (`events`)**: Product output streamed to observers, and the
//!   optional archive (`io/archive`). Unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber with `default_directive` as fallback.
///
/// Reads `RUST_LOG` first. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=pilot=debug pilot run --app app.apk --goal "Open settings"
/// ```
pub fn init_with(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Initialize tracing for the CLI. Defaults to `warn`.
pub fn init() {
    init_with("warn");
}

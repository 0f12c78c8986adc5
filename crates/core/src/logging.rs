//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,framepace=debug";

/// Initialize the global tracing subscriber.
///
/// Filtering follows `RUST_LOG` when present and falls back to
/// `info,framepace=debug`. Output includes targets and thread ids, which
/// matters here because command pools and descriptor pools are keyed by
/// thread.
///
/// # Example
/// ```
/// framepace_core::init_logging();
/// tracing::info!("frame scheduler ready");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // A second call (several tests in one binary) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}

//! Logging initialization with environment overrides.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Fallback directives when `RUST_LOG` is unset: the crate speaks at `info`,
/// everything else stays at `warn` so per-request traces from the HTTP
/// layers don't drown upload outcomes.
const DEFAULT_DIRECTIVES: &str = "warn,inlet=info";

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the defaults wholesale; uploads log their key and
/// byte count, so targets add little and are omitted from the output.
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

//! Tracing initialisation.

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub const LOG_ENV: &str = "EXPRLAB_LOG";

static INIT: Once = Once::new();

/// Installs the global subscriber. Reads per-target levels from `EXPRLAB_LOG`
/// (e.g. `EXPRLAB_LOG=exprlab::de_engine=debug`), falling back to
/// `exprlab=info`. Logs go to stderr so JSON on stdout stays clean.
/// Safe to call more than once.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("exprlab=info"));
        let _ = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .with(filter)
            .try_init();
    });
}

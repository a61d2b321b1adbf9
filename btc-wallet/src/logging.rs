//! Logging initialisation for the wallet.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Initialise console logging at the given level.
///
/// `RUST_LOG` overrides the level when set. Safe to call more than once;
/// later calls are no-ops.
pub fn init_console_logging(level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

//! Tracing initialisation.
//!
//! The daemon runs under an init process; diagnostics go to stderr where
//! the supervisor collects them. Verbosity is controlled by the
//! `DEVMON_LOG` environment variable (tracing `EnvFilter` syntax),
//! defaulting to `info`.

use tracing_subscriber::EnvFilter;

pub fn init() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::metadata::LevelFilter::INFO.into())
        .with_env_var("DEVMON_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .compact()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_env_filter(filter)
        .init();
}

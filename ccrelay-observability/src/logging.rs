//! Structured logging setup, lifted straight from the gateway's `main.rs`:
//! an env-filter that defaults to a CLI-settable level when
//! `RUST_LOG` isn't set, with target names suppressed for readability.

/// Initialize the global `tracing` subscriber. Call once, at process start.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

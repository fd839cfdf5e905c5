use tracing_subscriber::EnvFilter;

/// Initializes structured JSON logging. The `RUST_LOG` environment variable
/// overrides the level passed on the command line.
pub fn init_instrumentation(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .flatten_event(true)
        .init();
}

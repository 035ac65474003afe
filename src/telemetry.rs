use tracing_subscriber::EnvFilter;

/// Installs a fmt subscriber. `RUST_LOG` takes precedence over `default_filter`.
///
/// Returns `false` when a global subscriber was already set.
pub fn init_tracing(default_filter: Option<&str>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}

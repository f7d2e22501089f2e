use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber.
///
/// The filter comes from the explicit config value, then `RUST_LOG`, then
/// falls back to `info`.
pub fn init_tracing(log_filter: Option<&str>) {
    let filter = log_filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

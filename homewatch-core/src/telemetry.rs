use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber. `RUST_LOG` overrides `default_directive`.
///
/// Calling it twice (e.g. from tests) is harmless.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "readings_service=info,meter_store=info";

/// Logs go to stderr; stdout is reserved for command results.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

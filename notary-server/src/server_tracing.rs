use eyre::Result;
use tracing_subscriber::EnvFilter;

/// Sets up tracing for logging. The default level is info; override with
/// the RUST_LOG environment variable.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| eyre::eyre!("failed to init tracing subscriber: {e}"))?;
    Ok(())
}

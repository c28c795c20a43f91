use anyhow::Result;
use tracing_subscriber::{fmt, EnvFilter};

/// Diagnostics go to stderr: the orchestrator captures it into the
/// segment's log, and stdout is left alone.
pub fn init(verbose: u8) -> Result<()> {
    // RUST_LOG wins; otherwise -v picks the level.
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))?;

    Ok(())
}

//! Log output for binaries embedding the engine.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs a global subscriber that prints events to stderr and renders
/// span progress bars, such as the one of a running build, below them.
///
/// `RUST_LOG` takes precedence over `default_level`, which is usually
/// [`RunConfig::min_log_level`](crate::RunConfig::min_log_level).
pub fn init_logging(default_level: &str) -> anyhow::Result<()> {
    let indicatif_layer = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .try_init()?;
    Ok(())
}

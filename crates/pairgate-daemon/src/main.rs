//! pairgate-daemon binary entry point

use anyhow::Result;
use pairgate_daemon::{DaemonConfig, PairingDaemon};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = DaemonConfig::load()?;

    // Create and run daemon
    let daemon = PairingDaemon::new(config).await?;
    daemon.run().await?;

    Ok(())
}

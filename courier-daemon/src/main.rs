//! courierd binary entry point.
//!
//! Usage:
//! ```bash
//! courierd --config courierd.toml
//! ```

use courier_daemon::{Config, Service};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = get_config_path();
    let config = if config_path.exists() {
        tracing::info!(?config_path, "loading configuration");
        Config::load(&config_path)?
    } else {
        tracing::info!("no configuration file, using defaults");
        Config::default()
    };

    let service = Service::new(config).await?;

    let shutdown = service.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    service.run().await?;
    Ok(())
}

fn get_config_path() -> PathBuf {
    std::env::args()
        .skip_while(|arg| arg != "--config")
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("courierd.toml"))
}

//! kubernetes-database-scaler - controller entry point

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubernetes_database_scaler::config::{Config, Settings};
use kubernetes_database_scaler::orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::parse();
    let config = Config::try_from(settings)?;

    orchestrator::run(config).await?;

    tracing::info!("shut down cleanly");
    Ok(())
}

//! RAMS Daemon - rescue dispatch service
//!
//! Serves the service request ledger, dispatch assignment engine, and team
//! registry over HTTP.

use anyhow::Result;
use rams_common::RamsConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    info!("RAMS daemon v{} starting", env!("CARGO_PKG_VERSION"));

    let config = RamsConfig::load();
    info!("Database at {}", config.db_path.display());

    let state = ramsd::server::AppState::new(&config)?;
    ramsd::server::run(state, &config.listen_addr).await
}

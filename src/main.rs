// Tenant-Forge: operator console for the multi-tenant database platform
//
// Loads the platform configuration, connects every enabled subsystem and
// hands control to the REPL.

use anyhow::{Context, Result};
use std::sync::Arc;
use tenant_forge::cli::Repl;
use tenant_forge::config::PlatformConfig;
use tenant_forge::DatabaseManager;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = PlatformConfig::load().context("loading platform configuration")?;
    let platform = Arc::new(
        DatabaseManager::connect(config)
            .await
            .context("connecting the platform")?,
    );

    let result = match Repl::new(platform.clone()) {
        Ok(mut repl) => repl.run().await,
        Err(e) => Err(e),
    };

    platform.shutdown().await;
    result?;
    Ok(())
}

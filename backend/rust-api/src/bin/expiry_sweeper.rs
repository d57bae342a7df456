use std::time::Duration;

use anyhow::Context;
use sentence_trainer_api::{config::Config, services::expiry_sweeper::ExpirySweeper, AppState};

/// Runs the expiry sweep on its own, for deployments that keep it out of the API process.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentence_trainer_api=info".into()),
        )
        .init();

    let config = Config::load().context("Failed to load configuration")?;
    let interval = Duration::from_secs(config.sweeper.interval_secs);
    let app_state = AppState::connect(config)
        .await
        .context("Failed to initialize app state")?;

    let handle = ExpirySweeper::new(app_state.store.clone(), app_state.redis.clone(), interval).spawn();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

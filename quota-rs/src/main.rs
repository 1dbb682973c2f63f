use anyhow::Context;
use quota_rs::clock::SystemClock;
use quota_rs::config::Config;
use quota_rs::logging::init_tracing;
use quota_rs::{db, DailyResetScheduler, QuotaFacade};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = Config::load(&path).with_context(|| format!("loading {}", path))?;

    init_tracing(&config.logging);
    info!("Starting quota-rs");

    info!("Configuration loaded");
    info!("  Database: {}", config.storage.database_url);
    info!("  Daily limit: {} units", config.quota.daily_limit);
    info!(
        "  Burst limits: general {}/{}s, weather {}/{}s",
        config.rate_limit.general_chat.max_requests,
        config.rate_limit.general_chat.window_secs,
        config.rate_limit.weather_chat.max_requests,
        config.rate_limit.weather_chat.window_secs
    );

    // Initialize storage
    let pool = db::connect(&config.storage.database_url, config.storage.max_connections).await?;
    db::init_schema(&pool).await?;

    let facade = QuotaFacade::from_config(&config, pool.clone(), Arc::new(SystemClock))?;
    let scheduler = Arc::new(DailyResetScheduler::from_config(
        Arc::clone(facade.accountant()),
        &config.scheduler,
    )?);

    let shutdown = CancellationToken::new();
    let scheduler_handle = Arc::clone(&scheduler).start(shutdown.clone()).await;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    shutdown.cancel();

    if let Some(handle) = scheduler_handle {
        if let Err(e) = handle.await {
            error!("Scheduler task panic: {}", e);
        }
    }

    pool.close().await;
    info!("quota-rs stopped");
    Ok(())
}

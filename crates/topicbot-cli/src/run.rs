//! The `run` subcommand: the long-running scheduler service.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use topicbot_config::load_config;
use topicbot_scheduler::{Scheduler, SystemClock};
use topicbot_store::JobStore;
use topicbot_telegram::TelegramSender;

pub async fn run_service() -> Result<()> {
    let config = load_config().context("failed to load configuration")?;
    let bot_token = config
        .resolve_bot_token()
        .context("no bot token in config or TOPICBOT_BOT_TOKEN")?;

    let db_path = config.resolve_db_path()?;
    let store = Arc::new(JobStore::open(&db_path)?);
    info!(db = %db_path.display(), "job store opened");

    let sender = TelegramSender::new(&bot_token);
    sender.verify().await.context("bot token verification failed")?;

    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::new(sender),
        Arc::new(SystemClock),
        config.scheduler.clone(),
    ));
    scheduler.start().await;

    wait_for_shutdown_signal().await;
    info!("shutdown signal received");
    scheduler.shutdown().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

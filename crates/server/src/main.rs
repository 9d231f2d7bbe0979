mod bootstrap;
mod health;
mod poller;

use anyhow::Result;

use skipper_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use skipper_core::config::LogFormat;

    let level =
        config.logging.level.parse::<tracing::Level>().unwrap_or(tracing::Level::INFO);
    let builder = tracing_subscriber::fmt().with_target(false).with_max_level(level);

    match config.logging.format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.db_pool.clone(),
    )
    .await?;

    poller::spawn(
        app.autopilot.clone(),
        app.config.outbox.batch_size,
        app.config.outbox.poll_interval_secs,
    );

    let _ = &app.agent_runtime;

    tracing::info!(event_name = "system.server.started", "skipper-server started");
    wait_for_shutdown().await?;
    tracing::info!(event_name = "system.server.stopping", "skipper-server stopping");

    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

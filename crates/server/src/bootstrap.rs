use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use skipper_agent::{
    AgentRuntime, AutopilotRunner, EchoTool, FailoverChain, LlmClient, OpenAiCompatClient,
    RateLimiter, Router, SafetyGuard, ToolRegistry,
};
use skipper_core::config::{AppConfig, ConfigError, LlmProvider, LoadOptions};
use skipper_db::repositories::{
    SqlAgentRunRepository, SqlAuditTrailRepository, SqlAutopilotRunRepository,
    SqlInvocationRepository, SqlOutboxRepository,
};
use skipper_db::{connect_with_settings, migrations, DbPool};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub agent_runtime: Arc<AgentRuntime>,
    pub autopilot: Arc<AutopilotRunner>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let registry = Arc::new(default_registry());
    let llm = build_llm_chain(&config);
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit.window_ms,
        config.rate_limit.max_requests,
    ));

    let agent_runtime = Arc::new(AgentRuntime::new(
        Arc::new(SqlAgentRunRepository::new(db_pool.clone())),
        Arc::new(SqlInvocationRepository::new(db_pool.clone())),
        Arc::new(SqlAuditTrailRepository::new(db_pool.clone())),
        Arc::clone(&registry),
        SafetyGuard::new(),
        Router::new(config.llm.provider.as_str(), config.llm.model.clone()),
        Arc::clone(&llm),
        Arc::clone(&limiter),
        config.runtime.max_steps_per_run,
    ));

    let autopilot = Arc::new(AutopilotRunner::new(
        Arc::new(SqlOutboxRepository::new(db_pool.clone())),
        Arc::new(SqlAutopilotRunRepository::new(db_pool.clone())),
        registry,
        llm,
        limiter,
        config.outbox.max_retries,
    ));

    info!(
        event_name = "system.bootstrap.ready",
        provider = config.llm.provider.as_str(),
        model = %config.llm.model,
        "application bootstrap finished"
    );

    Ok(Application { config, db_pool, agent_runtime, autopilot })
}

fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry
}

/// Every supported provider speaks the chat-completions dialect, either
/// natively or through its compatibility endpoint, so a single client
/// type covers the chain.
fn build_llm_chain(config: &AppConfig) -> Arc<dyn LlmClient> {
    let base_url = config.llm.base_url.clone().unwrap_or_else(|| {
        match config.llm.provider {
            LlmProvider::OpenAi => "https://api.openai.com".to_string(),
            LlmProvider::Anthropic => "https://api.anthropic.com".to_string(),
            LlmProvider::Ollama => "http://localhost:11434".to_string(),
        }
    });

    let primary = Arc::new(OpenAiCompatClient::new(
        config.llm.provider.as_str(),
        config.llm.model.clone(),
        base_url,
        config.llm.api_key.clone(),
        Duration::from_secs(config.llm.timeout_secs),
    )) as Arc<dyn LlmClient>;

    Arc::new(FailoverChain::new(vec![primary]))
}

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub runtime: RuntimeConfig,
    pub outbox: OutboxConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Planning rounds allowed per agent run before the runtime
    /// synthesizes a final answer.
    pub max_steps_per_run: u32,
}

#[derive(Clone, Debug)]
pub struct OutboxConfig {
    pub batch_size: u32,
    pub max_retries: u32,
    pub poll_interval_secs: u64,
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Sliding window in milliseconds. Zero (or negative) disables
    /// throttling entirely.
    pub window_ms: i64,
    /// Admissions allowed per window. Zero or negative means unlimited.
    pub max_requests: i64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub max_steps_per_run: Option<u32>,
    pub outbox_batch_size: Option<u32>,
    pub outbox_max_retries: Option<u32>,
    pub rate_limit_window_ms: Option<i64>,
    pub rate_limit_max_requests: Option<i64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                health_check_port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://skipper.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 30,
            },
            runtime: RuntimeConfig { max_steps_per_run: 8 },
            outbox: OutboxConfig { batch_size: 10, max_retries: 5, poll_interval_secs: 15 },
            rate_limit: RateLimitConfig { window_ms: 60_000, max_requests: 30 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|anthropic|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    server: Option<ServerPatch>,
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    runtime: Option<RuntimePatch>,
    outbox: Option<OutboxPatch>,
    rate_limit: Option<RateLimitPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RuntimePatch {
    max_steps_per_run: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct OutboxPatch {
    batch_size: Option<u32>,
    max_retries: Option<u32>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitPatch {
    window_ms: Option<i64>,
    max_requests: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("skipper.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(server) = patch.server {
            merge(&mut self.server.bind_address, server.bind_address);
            merge(&mut self.server.health_check_port, server.health_check_port);
        }

        if let Some(database) = patch.database {
            merge(&mut self.database.url, database.url);
            merge(&mut self.database.max_connections, database.max_connections);
            merge(&mut self.database.timeout_secs, database.timeout_secs);
        }

        if let Some(llm) = patch.llm {
            merge(&mut self.llm.provider, llm.provider);
            merge(&mut self.llm.api_key, llm.api_key.map(|key| Some(key.into())));
            merge(&mut self.llm.base_url, llm.base_url.map(Some));
            merge(&mut self.llm.model, llm.model);
            merge(&mut self.llm.timeout_secs, llm.timeout_secs);
        }

        if let Some(runtime) = patch.runtime {
            merge(&mut self.runtime.max_steps_per_run, runtime.max_steps_per_run);
        }

        if let Some(outbox) = patch.outbox {
            merge(&mut self.outbox.batch_size, outbox.batch_size);
            merge(&mut self.outbox.max_retries, outbox.max_retries);
            merge(&mut self.outbox.poll_interval_secs, outbox.poll_interval_secs);
        }

        if let Some(rate_limit) = patch.rate_limit {
            merge(&mut self.rate_limit.window_ms, rate_limit.window_ms);
            merge(&mut self.rate_limit.max_requests, rate_limit.max_requests);
        }

        if let Some(logging) = patch.logging {
            merge(&mut self.logging.level, logging.level);
            merge(&mut self.logging.format, logging.format);
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("SKIPPER_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("SKIPPER_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_env("SKIPPER_SERVER_HEALTH_CHECK_PORT", value)?;
        }

        if let Some(value) = read_env("SKIPPER_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("SKIPPER_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("SKIPPER_DATABASE_MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = read_env("SKIPPER_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("SKIPPER_DATABASE_TIMEOUT_SECS", value)?;
        }

        if let Some(value) = read_env("SKIPPER_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("SKIPPER_LLM_API_KEY") {
            self.llm.api_key = Some(value.into());
        }
        if let Some(value) = read_env("SKIPPER_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("SKIPPER_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("SKIPPER_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("SKIPPER_LLM_TIMEOUT_SECS", value)?;
        }

        if let Some(value) = read_env("SKIPPER_RUNTIME_MAX_STEPS_PER_RUN") {
            self.runtime.max_steps_per_run = parse_env("SKIPPER_RUNTIME_MAX_STEPS_PER_RUN", value)?;
        }

        if let Some(value) = read_env("SKIPPER_OUTBOX_BATCH_SIZE") {
            self.outbox.batch_size = parse_env("SKIPPER_OUTBOX_BATCH_SIZE", value)?;
        }
        if let Some(value) = read_env("SKIPPER_OUTBOX_MAX_RETRIES") {
            self.outbox.max_retries = parse_env("SKIPPER_OUTBOX_MAX_RETRIES", value)?;
        }
        if let Some(value) = read_env("SKIPPER_OUTBOX_POLL_INTERVAL_SECS") {
            self.outbox.poll_interval_secs = parse_env("SKIPPER_OUTBOX_POLL_INTERVAL_SECS", value)?;
        }

        if let Some(value) = read_env("SKIPPER_RATE_LIMIT_WINDOW_MS") {
            self.rate_limit.window_ms = parse_env("SKIPPER_RATE_LIMIT_WINDOW_MS", value)?;
        }
        if let Some(value) = read_env("SKIPPER_RATE_LIMIT_MAX_REQUESTS") {
            self.rate_limit.max_requests = parse_env("SKIPPER_RATE_LIMIT_MAX_REQUESTS", value)?;
        }

        if let Some(value) = read_env("SKIPPER_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = read_env("SKIPPER_LOG_FORMAT") {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(url) = overrides.database_url {
            self.database.url = url;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(provider) = overrides.llm_provider {
            self.llm.provider = provider;
        }
        if let Some(model) = overrides.llm_model {
            self.llm.model = model;
        }
        if let Some(max_steps) = overrides.max_steps_per_run {
            self.runtime.max_steps_per_run = max_steps;
        }
        if let Some(batch_size) = overrides.outbox_batch_size {
            self.outbox.batch_size = batch_size;
        }
        if let Some(max_retries) = overrides.outbox_max_retries {
            self.outbox.max_retries = max_retries;
        }
        if let Some(window_ms) = overrides.rate_limit_window_ms {
            self.rate_limit.window_ms = window_ms;
        }
        if let Some(max_requests) = overrides.rate_limit_max_requests {
            self.rate_limit.max_requests = max_requests;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Validation("database.url must not be empty".to_string()));
        }
        if self.runtime.max_steps_per_run == 0 {
            return Err(ConfigError::Validation(
                "runtime.max_steps_per_run must be at least 1".to_string(),
            ));
        }
        if self.outbox.batch_size == 0 {
            return Err(ConfigError::Validation(
                "outbox.batch_size must be at least 1".to_string(),
            ));
        }
        if self.llm.model.trim().is_empty() {
            return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}

fn resolve_config_path(requested: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = requested {
        return path.exists().then(|| path.to_path_buf());
    }
    let default = PathBuf::from("skipper.toml");
    default.exists().then_some(default)
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    toml::from_str(&raw)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

/// Overwrite `slot` only when the patch carried a value.
fn merge<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::InvalidEnvOverride { key: key.to_string(), value })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{AppConfig, ConfigOverrides, LlmProvider, LoadOptions, LogFormat};

    #[test]
    fn defaults_validate() {
        let config = AppConfig::load(LoadOptions::default()).expect("defaults load");
        assert_eq!(config.runtime.max_steps_per_run, 8);
        assert_eq!(config.outbox.max_retries, 5);
        assert_eq!(config.logging.format, LogFormat::Compact);
    }

    #[test]
    fn toml_patch_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            r#"
[database]
url = "sqlite::memory:"

[runtime]
max_steps_per_run = 6

[outbox]
batch_size = 3
max_retries = 2

[rate_limit]
window_ms = 1000
max_requests = 2

[llm]
provider = "openai"
model = "gpt-4o-mini"
"#
        )
        .expect("write config");

        let config = AppConfig::load(LoadOptions {
            config_path: Some(file.path().to_path_buf()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        })
        .expect("patched config loads");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.runtime.max_steps_per_run, 6);
        assert_eq!(config.outbox.batch_size, 3);
        assert_eq!(config.rate_limit.window_ms, 1000);
        assert_eq!(config.llm.provider, LlmProvider::OpenAi);
    }

    #[test]
    fn programmatic_overrides_win() {
        let config = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                max_steps_per_run: Some(1),
                rate_limit_window_ms: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .expect("overridden config loads");

        assert_eq!(config.database.url, "sqlite::memory:");
        assert_eq!(config.runtime.max_steps_per_run, 1);
        assert_eq!(config.rate_limit.window_ms, 0);
    }

    #[test]
    fn zero_step_limit_is_rejected() {
        let result = AppConfig::load(LoadOptions {
            overrides: ConfigOverrides {
                max_steps_per_run: Some(0),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn missing_required_file_is_an_error() {
        let result = AppConfig::load(LoadOptions {
            config_path: Some("does-not-exist.toml".into()),
            require_file: true,
            overrides: ConfigOverrides::default(),
        });
        assert!(result.is_err());
    }
}

use std::fmt;
use std::path::PathBuf;
use std::{env, fs};

use skipper_core::config::{AppConfig, LoadOptions};
use toml::Value;

enum Source {
    Env(String),
    File(String),
    Default,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Env(key) => write!(f, "env ({key})"),
            Self::File(path) => write!(f, "file ({path})"),
            Self::Default => write!(f, "default"),
        }
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file = load_config_file();

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    let mut line = |key: &str, value: &str, env_key: &str| {
        let source = resolve_source(key, env_key, file.as_ref());
        lines.push(format!("- {key} = {value} (source: {source})"));
    };

    line("database.url", &config.database.url, "SKIPPER_DATABASE_URL");
    line(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        "SKIPPER_DATABASE_MAX_CONNECTIONS",
    );
    line(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        "SKIPPER_DATABASE_TIMEOUT_SECS",
    );

    line("llm.provider", config.llm.provider.as_str(), "SKIPPER_LLM_PROVIDER");
    line("llm.model", &config.llm.model, "SKIPPER_LLM_MODEL");
    line(
        "llm.base_url",
        config.llm.base_url.as_deref().unwrap_or("<unset>"),
        "SKIPPER_LLM_BASE_URL",
    );
    // The key value itself never leaves the secrecy wrapper here.
    let llm_api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    line("llm.api_key", llm_api_key, "SKIPPER_LLM_API_KEY");
    line("llm.timeout_secs", &config.llm.timeout_secs.to_string(), "SKIPPER_LLM_TIMEOUT_SECS");

    line(
        "runtime.max_steps_per_run",
        &config.runtime.max_steps_per_run.to_string(),
        "SKIPPER_RUNTIME_MAX_STEPS_PER_RUN",
    );

    line("outbox.batch_size", &config.outbox.batch_size.to_string(), "SKIPPER_OUTBOX_BATCH_SIZE");
    line(
        "outbox.max_retries",
        &config.outbox.max_retries.to_string(),
        "SKIPPER_OUTBOX_MAX_RETRIES",
    );
    line(
        "outbox.poll_interval_secs",
        &config.outbox.poll_interval_secs.to_string(),
        "SKIPPER_OUTBOX_POLL_INTERVAL_SECS",
    );

    line(
        "rate_limit.window_ms",
        &config.rate_limit.window_ms.to_string(),
        "SKIPPER_RATE_LIMIT_WINDOW_MS",
    );
    line(
        "rate_limit.max_requests",
        &config.rate_limit.max_requests.to_string(),
        "SKIPPER_RATE_LIMIT_MAX_REQUESTS",
    );

    line("server.bind_address", &config.server.bind_address, "SKIPPER_SERVER_BIND_ADDRESS");
    line(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        "SKIPPER_SERVER_HEALTH_CHECK_PORT",
    );

    line("logging.level", &config.logging.level, "SKIPPER_LOG_LEVEL");
    line("logging.format", &format!("{:?}", config.logging.format), "SKIPPER_LOG_FORMAT");

    lines.join("\n")
}

fn load_config_file() -> Option<(PathBuf, Value)> {
    let path = ["skipper.toml", "config/skipper.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())?;
    let doc = fs::read_to_string(&path).ok()?.parse::<Value>().ok()?;
    Some((path, doc))
}

fn resolve_source(key_path: &str, env_key: &str, file: Option<&(PathBuf, Value)>) -> Source {
    if env::var_os(env_key).is_some() {
        return Source::Env(env_key.to_string());
    }

    if let Some((path, doc)) = file {
        if lookup(doc, key_path).is_some() {
            return Source::File(path.display().to_string());
        }
    }

    Source::Default
}

fn lookup<'a>(root: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path.split('.').try_fold(root, |node, key| node.get(key))
}

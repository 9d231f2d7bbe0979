//! OpenAI-compatible chat completion client.
//!
//! Covers any endpoint speaking the `/v1/chat/completions` dialect,
//! including Ollama and most hosted gateways. Connection-level failures
//! and 5xx/429 responses classify as [`LlmError::Unavailable`] so the
//! failover chain can move on; everything else is a provider error.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::llm::{GenerateOptions, LlmClient, LlmError};

pub struct OpenAiCompatClient {
    provider: String,
    model: String,
    base_url: String,
    api_key: Option<SecretString>,
    http: reqwest::Client,
    default_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

impl OpenAiCompatClient {
    pub fn new(
        provider: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<SecretString>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key,
            http: reqwest::Client::new(),
            default_timeout,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn classify(&self, error: reqwest::Error) -> LlmError {
        if error.is_connect() || error.is_timeout() {
            return LlmError::Unavailable(error.to_string());
        }
        LlmError::Provider(error.to_string())
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}],
        });
        if let Some(temperature) = options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if options.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        let mut request = self
            .http
            .post(self.completions_url())
            .timeout(options.timeout.unwrap_or(self.default_timeout))
            .json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key.expose_secret());
        }

        let response = request.send().await.map_err(|error| self.classify(error))?;
        let status = response.status();

        if status.is_server_error() || status.as_u16() == 429 {
            return Err(LlmError::Unavailable(format!(
                "{} returned status {status}",
                self.provider
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Provider(format!(
                "{} returned status {status}: {detail}",
                self.provider
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|error| LlmError::Provider(format!("malformed completion body: {error}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| LlmError::Provider("completion had no choices".to_string()))
    }
}

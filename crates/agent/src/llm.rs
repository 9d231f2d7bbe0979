//! Language model client contract.
//!
//! The core never talks to a provider directly. It goes through
//! [`LlmClient`], and in production through a [`FailoverChain`] that tries
//! each configured provider once per call. Only errors classified as
//! [`LlmError::Unavailable`] (connection refused, timeout, 503, DNS) are
//! retryable by failover; everything else propagates immediately.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Clone, Debug, Default)]
pub struct GenerateOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Ask the provider for a JSON object response where supported.
    pub json_mode: bool,
    pub timeout: Option<Duration>,
}

impl GenerateOptions {
    pub fn json() -> Self {
        Self { json_mode: true, ..Self::default() }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LlmError {
    /// The provider could not be reached at all; the failover chain may
    /// try the next one.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    /// The provider answered with a non-retryable error.
    #[error("provider error: {0}")]
    Provider(String),
    /// Every provider in the chain was tried once and failed.
    #[error("all providers exhausted: {0}")]
    Exhausted(String),
}

/// One chunk of streamed generation output. The channel closing without a
/// trailing `Err` means the generation finished cleanly.
pub type StreamChunk = Result<String, LlmError>;

#[async_trait]
pub trait LlmClient: Send + Sync {
    fn provider(&self) -> &str;

    fn model(&self) -> &str;

    async fn generate(&self, prompt: &str, options: &GenerateOptions)
        -> Result<String, LlmError>;

    /// Streamed variant. The default implementation generates the full
    /// response and yields it as a single chunk, which keeps providers
    /// without streaming support honest about completion and errors.
    async fn generate_stream(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<mpsc::Receiver<StreamChunk>, LlmError> {
        let (sender, receiver) = mpsc::channel(1);
        let text = self.generate(prompt, options).await?;
        let _ = sender.send(Ok(text)).await;
        Ok(receiver)
    }
}

/// Tries each configured provider once per call, in order.
pub struct FailoverChain {
    providers: Vec<Arc<dyn LlmClient>>,
}

impl FailoverChain {
    pub fn new(providers: Vec<Arc<dyn LlmClient>>) -> Self {
        Self { providers }
    }
}

#[async_trait]
impl LlmClient for FailoverChain {
    fn provider(&self) -> &str {
        self.providers.first().map(|client| client.provider()).unwrap_or("none")
    }

    fn model(&self) -> &str {
        self.providers.first().map(|client| client.model()).unwrap_or("none")
    }

    async fn generate(
        &self,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        let mut last_unavailable = String::from("no providers configured");

        for client in &self.providers {
            match client.generate(prompt, options).await {
                Ok(text) => return Ok(text),
                Err(LlmError::Unavailable(message)) => {
                    tracing::warn!(
                        event_name = "llm.provider_unavailable",
                        provider = client.provider(),
                        model = client.model(),
                        error = %message,
                        "provider unavailable, trying next in chain"
                    );
                    last_unavailable = format!("{}: {message}", client.provider());
                }
                Err(error) => return Err(error),
            }
        }

        Err(LlmError::Exhausted(last_unavailable))
    }
}

/// Scripted client for tests and smoke runs. Responses are consumed in
/// order; running past the script is a provider error, not a panic.
#[derive(Default)]
pub struct MockLlm {
    responses: Mutex<Vec<Result<String, LlmError>>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn scripted(responses: Vec<Result<String, LlmError>>) -> Self {
        Self { responses: Mutex::new(responses), calls: Mutex::new(Vec::new()) }
    }

    pub fn replying(responses: Vec<&str>) -> Self {
        Self::scripted(responses.into_iter().map(|text| Ok(text.to_string())).collect())
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    fn provider(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        prompt: &str,
        _options: &GenerateOptions,
    ) -> Result<String, LlmError> {
        self.calls.lock().expect("calls lock").push(prompt.to_string());
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(LlmError::Provider("mock script exhausted".to_string()));
        }
        responses.remove(0)
    }
}

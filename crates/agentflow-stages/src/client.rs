//! Anthropic Messages API client
//!
//! Every call is a single stateless exchange: an optional system prompt and one
//! user message. Rate limits (429) and server errors (5xx) are retried with
//! exponential backoff, honoring `retry-after`. Other failures count against a
//! per-client circuit breaker.

use crate::auth::{self, Credential};
use crate::circuit_breaker::CircuitBreaker;
use crate::types::{AnthropicMessage, AnthropicRequest, AnthropicResponse, Completion, Model};
use agentflow_core::config::ModelSettings;
use agentflow_core::{FlowError, Result};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Retry schedule for 429 and 5xx responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff after `current`, doubled and capped
    pub fn next_backoff(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_backoff)
    }
}

/// Client shared by the LLM-backed stages
#[derive(Debug, Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    credential: Credential,
    model: Model,
    max_tokens: usize,
    endpoint: String,
    retry: RetryPolicy,
    breaker: Arc<CircuitBreaker>,
}

impl LlmClient {
    pub fn new(credential: Credential, model: Model) -> Self {
        Self {
            http: reqwest::Client::new(),
            credential,
            model,
            max_tokens: ModelSettings::default().max_tokens,
            endpoint: ANTHROPIC_API_URL.to_string(),
            retry: RetryPolicy::default(),
            breaker: Arc::new(CircuitBreaker::default()),
        }
    }

    /// Build from `[model]` settings, resolving credentials from the environment
    pub fn from_settings(settings: &ModelSettings) -> Result<Self> {
        let model: Model = settings
            .default
            .parse()
            .map_err(FlowError::Config)?;
        let credential = auth::resolve_credential(&settings.api_key_env)?;
        Ok(Self::new(credential, model).with_max_tokens(settings.max_tokens))
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn model(&self) -> Model {
        self.model
    }

    /// Send one prompt and return the reply text
    pub async fn complete(&self, system: Option<&str>, prompt: &str) -> Result<Completion> {
        if !self.breaker.can_execute() {
            return Err(FlowError::ApiLimit(format!(
                "Circuit breaker is OPEN after repeated API failures. Retry in {}s.",
                self.breaker.time_until_retry().as_secs()
            )));
        }

        let request = AnthropicRequest {
            model: self.model.api_name().to_string(),
            max_tokens: self.max_tokens,
            system: system.map(str::to_string),
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };
        let (auth_header, auth_value) = self.credential.header();

        let mut retries = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            tracing::debug!(
                "Sending {} char prompt to {} (attempt {})",
                prompt.len(),
                self.model,
                retries + 1
            );

            let mut builder = self
                .http
                .post(&self.endpoint)
                .header(auth_header, &auth_value)
                .header("anthropic-version", ANTHROPIC_VERSION)
                .json(&request);
            if matches!(self.credential, Credential::OAuth(_)) {
                builder = builder.header("anthropic-beta", OAUTH_BETA);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| FlowError::Api(format!("Failed to send request: {}", e)))?;
            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                retries += 1;
                let wait = retry_after(response.headers()).unwrap_or(backoff);
                let body = response.text().await.unwrap_or_default();

                if retries > self.retry.max_retries {
                    if status.is_server_error() {
                        self.breaker.record_failure();
                        return Err(FlowError::Api(format!(
                            "Anthropic API error {} after {} retries: {}",
                            status, self.retry.max_retries, body
                        )));
                    }
                    return Err(FlowError::ApiLimit(format!(
                        "Rate limit exceeded after {} retries: {}",
                        self.retry.max_retries, body
                    )));
                }

                tracing::warn!(
                    "API returned {}. Waiting {:?} before retry {}/{}",
                    status,
                    wait,
                    retries,
                    self.retry.max_retries
                );
                tokio::time::sleep(wait).await;
                backoff = self.retry.next_backoff(backoff);
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                self.breaker.record_failure();
                tracing::error!(
                    "Circuit breaker: recorded failure (count: {})",
                    self.breaker.failure_count()
                );
                return Err(match status.as_u16() {
                    401 | 403 => FlowError::Auth(format!("Anthropic API rejected credentials: {}", body)),
                    _ => FlowError::Api(format!("Anthropic API error {}: {}", status, body)),
                });
            }

            let parsed: AnthropicResponse = response
                .json()
                .await
                .map_err(|e| FlowError::Api(format!("Failed to parse response: {}", e)))?;
            self.breaker.record_success();

            let text = parsed.text();
            if text.trim().is_empty() {
                return Err(FlowError::Api("No text content in response".to_string()));
            }

            match &parsed.usage {
                Some(usage) => tracing::info!(
                    "Model reply: {} chars, {} input tokens, {} output tokens",
                    text.len(),
                    usage.input_tokens,
                    usage.output_tokens
                ),
                None => tracing::info!("Model reply: {} chars", text.len()),
            }

            return Ok(Completion {
                text,
                usage: parsed.usage,
            });
        }
    }
}

/// Seconds from a `retry-after` header, if present and numeric
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

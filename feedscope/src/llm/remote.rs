use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use super::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};
use crate::error::FeedscopeError;

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_TOKENS: usize = 500;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(500);

/// Remote LLM provider using OpenAI-compatible HTTP API
pub struct RemoteLlmProvider {
    base_url: String,
    api_key: String,
    model: String,
    default_timeout: Duration,
    default_max_tokens: usize,
    default_temperature: f32,
    max_attempts: u32,
    retry_base: Duration,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            default_max_tokens: DEFAULT_MAX_TOKENS,
            default_temperature: 0.3,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base: DEFAULT_RETRY_BASE,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(
        mut self,
        timeout_secs: u64,
        max_tokens: usize,
        temperature: f32,
    ) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self.default_temperature = temperature;
        self
    }

    /// Attempts include the first call. Backoff before retry `n` is a random
    /// delay in `[0, base * 2^(n-1)]`.
    pub fn with_retry(mut self, max_attempts: u32, base: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_base = base;
        self
    }

    /// Build from the `[llm]` config section. The API key is read from the
    /// configured env var and must be present.
    pub fn from_config(cfg: &common::LlmConfig) -> crate::error::Result<Self> {
        let api_url = cfg
            .api_url
            .clone()
            .ok_or_else(|| FeedscopeError::Configuration("[llm] api_url is required".to_string()))?;
        let key_env = cfg.api_key_env.as_deref().unwrap_or("LLM_API_KEY");
        let api_key = std::env::var(key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                FeedscopeError::Configuration(format!("LLM API key env var {} is not set", key_env))
            })?;
        let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());

        Ok(Self::new(api_url, api_key, model)
            .with_defaults(
                cfg.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECS),
                cfg.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
                0.3,
            )
            .with_retry(
                cfg.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
                DEFAULT_RETRY_BASE,
            ))
    }

    fn backoff(&self, retry: u32) -> Duration {
        let cap = self
            .retry_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        let cap_ms = cap.as_millis().min(u64::MAX as u128) as u64;
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
    }

    async fn attempt(&self, body: &OpenAiRequest) -> Result<LlmResponse, Attempt> {
        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(anyhow::Error::new(e).context("LLM HTTP request failed")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = anyhow::anyhow!("LLM API error {}: {}", status, body);
            return Err(if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                Attempt::Retry(err)
            } else {
                Attempt::Fatal(err)
            });
        }

        let resp_body: OpenAiResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")
            .map_err(Attempt::Fatal)?;

        let choice = resp_body
            .choices
            .first()
            .context("LLM response has no choices")
            .map_err(Attempt::Fatal)?;

        let usage = resp_body.usage.unwrap_or_default();
        Ok(LlmResponse {
            content: choice.message.content.clone(),
            usage: UsageMetadata {
                prompt_tokens: usage.prompt_tokens.unwrap_or(0),
                completion_tokens: usage.completion_tokens.unwrap_or(0),
                total_tokens: usage.total_tokens.unwrap_or(0),
            },
            model: resp_body.model.unwrap_or_else(|| self.model.clone()),
        })
    }
}

/// Outcome of one failed call.
enum Attempt {
    Retry(anyhow::Error),
    Fatal(anyhow::Error),
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let req_body = OpenAiRequest {
            model: self.model.clone(),
            messages: request
                .messages
                .into_iter()
                .map(|m| Message {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
            max_tokens: Some(request.max_tokens.unwrap_or(self.default_max_tokens)),
            temperature: Some(request.temperature.unwrap_or(self.default_temperature)),
        };

        let mut attempt = 1;
        loop {
            // the deadline covers reading the body too
            let outcome = tokio::time::timeout(timeout, self.attempt(&req_body))
                .await
                .unwrap_or_else(|_| {
                    Err(Attempt::Retry(anyhow::anyhow!("LLM request timed out after {:?}", timeout)))
                });
            match outcome {
                Ok(response) => return Ok(response),
                Err(Attempt::Fatal(e)) => return Err(e),
                Err(Attempt::Retry(e)) if attempt >= self.max_attempts => {
                    return Err(e.context(format!("giving up after {} attempts", attempt)))
                }
                Err(Attempt::Retry(e)) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "LLM call failed (attempt {}/{}): {:#}, retrying in {:?}",
                        attempt, self.max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_bounded_by_exponential_cap() {
        let provider = RemoteLlmProvider::new("http://x", "k", "m")
            .with_retry(5, Duration::from_millis(100));
        for _ in 0..50 {
            assert!(provider.backoff(1) <= Duration::from_millis(100));
            assert!(provider.backoff(3) <= Duration::from_millis(400));
        }
    }

    #[test]
    fn test_from_config_requires_api_key() {
        let cfg = common::LlmConfig {
            api_url: Some("http://localhost/v1/chat/completions".to_string()),
            api_key_env: Some("FEEDSCOPE_TEST_MISSING_KEY".to_string()),
            ..Default::default()
        };
        let err = RemoteLlmProvider::from_config(&cfg).err().unwrap();
        assert!(matches!(err, FeedscopeError::Configuration(_)));
    }

    #[test]
    fn test_from_config_takes_attempt_count() {
        std::env::set_var("FEEDSCOPE_TEST_ATTEMPTS_KEY", "k");
        let cfg = common::LlmConfig {
            api_url: Some("http://localhost/v1/chat/completions".to_string()),
            api_key_env: Some("FEEDSCOPE_TEST_ATTEMPTS_KEY".to_string()),
            max_attempts: Some(2),
            ..Default::default()
        };
        let provider = RemoteLlmProvider::from_config(&cfg).unwrap();
        assert_eq!(provider.max_attempts, 2);

        let defaults = common::LlmConfig {
            max_attempts: None,
            ..cfg
        };
        let provider = RemoteLlmProvider::from_config(&defaults).unwrap();
        assert_eq!(provider.max_attempts, DEFAULT_MAX_ATTEMPTS);
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let provider = RemoteLlmProvider::new("http://x", "k", "m").with_retry(0, Duration::ZERO);
        assert_eq!(provider.max_attempts, 1);
    }
}

//! Chat-completion client with a rotating credential pool and rate-limit retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use jobmon_storage::{retry, BackoffPolicy};
use rand::Rng;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.groq.com/openai/v1";
pub const DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";
pub const DEFAULT_CLASSIFY_MODEL: &str = "llama-3.1-8b-instant";
pub const DEFAULT_MAX_RETRIES: usize = 3;

pub const EMPTY_JSON_REPLY: &str = "{}";
pub const NO_KEYS_REPLY: &str = "Error: No API keys configured";
pub const RATE_LIMITED_REPLY: &str = "Error: Rate limit exceeded on all keys.";
pub const FAILED_REPLY: &str = "Error generating response";

/// Numbered credential variables checked before the single-key fallback.
const KEY_SLOTS: std::ops::RangeInclusive<u8> = 1..=9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Ask the model for a JSON object.
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub prompt: String,
    pub mode: ResponseMode,
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("no API keys configured")]
    NotConfigured,
    #[error("rate limit exceeded (429): {0}")]
    RateLimited(String),
    #[error("completion API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("completion request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("no content in completion response")]
    EmptyResponse,
}

impl CompletionError {
    /// HTTP 429, or any error whose text mentions a rate limit.
    pub fn is_rate_limit(&self) -> bool {
        match self {
            Self::RateLimited(_) => true,
            Self::NotConfigured => false,
            other => {
                let text = other.to_string().to_lowercase();
                text.contains("429") || text.contains("rate limit")
            }
        }
    }
}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, api_key: &str, request: &ChatRequest) -> Result<String, CompletionError>;
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// OpenAI-compatible `/chat/completions` over reqwest.
#[derive(Debug, Clone)]
pub struct ChatCompletionsBackend {
    http: reqwest::Client,
    base_url: String,
}

impl ChatCompletionsBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building completion http client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CompletionBackend for ChatCompletionsBackend {
    async fn complete(&self, api_key: &str, request: &ChatRequest) -> Result<String, CompletionError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = ChatBody {
            model: &request.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            response_format: (request.mode == ResponseMode::Json).then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        debug!(model = %request.model, "chat completion request");

        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(CompletionError::RateLimited(response.text().await.unwrap_or_default()));
        }
        if !status.is_success() {
            return Err(CompletionError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(CompletionError::EmptyResponse)
    }
}

#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_keys: Vec<String>,
    pub base_url: String,
    pub model: String,
    pub classify_model: String,
    pub timeout: Duration,
    pub retry_unit: Duration,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            classify_model: DEFAULT_CLASSIFY_MODEL.to_string(),
            timeout: Duration::from_secs(60),
            retry_unit: Duration::from_secs(1),
        }
    }
}

impl AiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let present = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut api_keys: Vec<String> = KEY_SLOTS
            .filter_map(|slot| present(&format!("GROQ_API_KEY_{slot}")))
            .collect();
        if api_keys.is_empty() {
            api_keys.extend(present("GROQ_API_KEY"));
        }

        let defaults = Self::default();
        Self {
            api_keys,
            base_url: present("AI_BASE_URL").unwrap_or(defaults.base_url),
            model: present("AI_MODEL").unwrap_or(defaults.model),
            classify_model: present("AI_CLASSIFY_MODEL").unwrap_or(defaults.classify_model),
            timeout: present("AI_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            retry_unit: defaults.retry_unit,
        }
    }
}

/// Shared handle over the immutable credential pool. Cloning is cheap.
#[derive(Clone)]
pub struct AiClient {
    keys: Arc<[String]>,
    backend: Arc<dyn CompletionBackend>,
    model: String,
    retry_unit: Duration,
}

impl std::fmt::Debug for AiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiClient")
            .field("keys", &self.keys.len())
            .field("model", &self.model)
            .finish()
    }
}

impl AiClient {
    pub fn new(
        keys: Vec<String>,
        backend: Arc<dyn CompletionBackend>,
        model: impl Into<String>,
        retry_unit: Duration,
    ) -> Self {
        Self {
            keys: keys.into(),
            backend,
            model: model.into(),
            retry_unit,
        }
    }

    pub fn from_config(config: &AiConfig) -> anyhow::Result<Self> {
        let backend = ChatCompletionsBackend::new(&config.base_url, config.timeout)?;
        Ok(Self::new(
            config.api_keys.clone(),
            Arc::new(backend),
            config.model.clone(),
            config.retry_unit,
        ))
    }

    pub fn is_configured(&self) -> bool {
        !self.keys.is_empty()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Same credentials and backend, different default model.
    pub fn with_model(&self, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..self.clone()
        }
    }

    fn pick_key(&self) -> &str {
        let index = rand::rng().random_range(0..self.keys.len());
        &self.keys[index]
    }

    /// Up to `max_retries` attempts. Only rate-limit failures are retried,
    /// with a linearly growing pause; anything else is returned at once.
    pub async fn try_generate(
        &self,
        prompt: &str,
        mode: ResponseMode,
        max_retries: usize,
    ) -> Result<String, CompletionError> {
        if !self.is_configured() {
            return Err(CompletionError::NotConfigured);
        }

        let request = ChatRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            mode,
        };
        let attempts = max_retries.max(1);
        let backoff = BackoffPolicy::linear(self.retry_unit, attempts);
        let request = &request;

        retry(attempts, &backoff, CompletionError::is_rate_limit, move |attempt| {
            let key = self.pick_key();
            async move {
                let result = self.backend.complete(key, request).await;
                if let Err(err) = &result {
                    if err.is_rate_limit() {
                        warn!(attempt = attempt + 1, attempts, "completion rate limited");
                    }
                }
                result
            }
        })
        .await
    }

    /// Like [`AiClient::try_generate`] with the default retry budget, folding
    /// failures into fixed reply strings.
    pub async fn generate(&self, prompt: &str, mode: ResponseMode) -> String {
        match self.try_generate(prompt, mode, DEFAULT_MAX_RETRIES).await {
            Ok(content) => content,
            Err(err) => {
                if !matches!(err, CompletionError::NotConfigured) {
                    error!(error = %err, "completion failed");
                }
                degraded_reply(&err, mode).to_string()
            }
        }
    }
}

pub fn degraded_reply(err: &CompletionError, mode: ResponseMode) -> &'static str {
    match (mode, err) {
        (ResponseMode::Json, _) => EMPTY_JSON_REPLY,
        (ResponseMode::Text, CompletionError::NotConfigured) => NO_KEYS_REPLY,
        (ResponseMode::Text, err) if err.is_rate_limit() => RATE_LIMITED_REPLY,
        (ResponseMode::Text, _) => FAILED_REPLY,
    }
}

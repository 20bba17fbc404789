//! # Oracle Transport
//!
//! Shared HTTP client for the Anthropic Messages API used by both the
//! classification and the vision oracles. Every call goes through the
//! circuit breaker, a per-attempt timeout and exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn, Instrument};

use crate::circuit_breaker::{calculate_retry_delay, CircuitBreaker};
use crate::config::OracleConfig;
use crate::errors::error_logging;
use crate::observability::{self, oracle_span};

lazy_static! {
    static ref LEADING_FENCE: Regex =
        Regex::new(r"^```[a-z]*\n?").expect("Leading fence pattern should be valid");
    static ref TRAILING_FENCE: Regex =
        Regex::new(r"\n?```$").expect("Trailing fence pattern should be valid");
}

/// Failures talking to an external oracle
#[derive(Debug, Clone, PartialEq)]
pub enum OracleError {
    /// No API key configured
    MissingApiKey,
    /// Connection or transport failure
    Network(String),
    /// Non-success HTTP status
    Http { status: u16, body: String },
    /// Reply could not be decoded
    Parse(String),
    /// Too many recent failures; calls are short-circuited
    CircuitOpen,
    /// One attempt exceeded the configured timeout
    Timeout(u64),
    /// Input the oracle cannot take (e.g. a PDF for the vision pass)
    Unsupported(String),
}

impl std::fmt::Display for OracleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OracleError::MissingApiKey => write!(f, "[ORACLE_KEY] No API key configured"),
            OracleError::Network(msg) => write!(f, "[ORACLE_NETWORK] {}", msg),
            OracleError::Http { status, body } => {
                write!(f, "[ORACLE_HTTP] Status {}: {}", status, body)
            }
            OracleError::Parse(msg) => write!(f, "[ORACLE_PARSE] {}", msg),
            OracleError::CircuitOpen => write!(
                f,
                "[ORACLE_UNAVAILABLE] Oracle temporarily disabled after repeated failures"
            ),
            OracleError::Timeout(secs) => write!(f, "[ORACLE_TIMEOUT] No reply within {}s", secs),
            OracleError::Unsupported(msg) => write!(f, "[ORACLE_UNSUPPORTED] {}", msg),
        }
    }
}

impl std::error::Error for OracleError {}

impl From<reqwest::Error> for OracleError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            OracleError::Parse(err.to_string())
        } else {
            OracleError::Network(err.to_string())
        }
    }
}

impl OracleError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Network(_) | OracleError::Timeout(_) => true,
            OracleError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Remove a surrounding markdown code fence from a model reply
pub fn strip_markdown_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_leading = LEADING_FENCE.replace(trimmed, "");
    TRAILING_FENCE.replace(&without_leading, "").trim().to_string()
}

/// Decode a JSON reply, tolerating markdown fences
pub fn parse_json_reply<T: DeserializeOwned>(raw: &str) -> Result<T, OracleError> {
    serde_json::from_str(&strip_markdown_fences(raw))
        .map_err(|e| OracleError::Parse(format!("Invalid JSON reply: {}", e)))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
    Image { source: ImageSource },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    /// Base64 image block
    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            source: ImageSource {
                kind: "base64",
                media_type: media_type.into(),
                data: data.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub role: &'static str,
    pub content: Vec<ContentBlock>,
}

/// Body of `POST /v1/messages`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagesRequest {
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
}

impl MessagesRequest {
    /// Single user turn
    pub fn user(model: impl Into<String>, max_tokens: u32, content: Vec<ContentBlock>) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            system: None,
            messages: vec![Message {
                role: "user",
                content,
            }],
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Messages API client with retry and circuit breaking
#[derive(Debug, Clone)]
pub struct MessagesClient {
    http: reqwest::Client,
    config: OracleConfig,
    breaker: Arc<CircuitBreaker>,
}

impl MessagesClient {
    pub fn new(config: OracleConfig) -> Result<Self, OracleError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| OracleError::Network(format!("Failed to build HTTP client: {}", e)))?;
        let breaker = Arc::new(CircuitBreaker::new(config.recovery.clone()));
        Ok(Self {
            http,
            config,
            breaker,
        })
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }

    /// Send one request and return the text of the first content block
    pub async fn create_message(
        &self,
        operation: &str,
        request: &MessagesRequest,
    ) -> Result<String, OracleError> {
        let span = oracle_span(operation, &request.model);
        self.create_message_with_retry(operation, request)
            .instrument(span)
            .await
    }

    async fn create_message_with_retry(
        &self,
        operation: &str,
        request: &MessagesRequest,
    ) -> Result<String, OracleError> {
        let start_time = Instant::now();
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(OracleError::MissingApiKey)?;

        if self.breaker.is_open() {
            warn!(operation = %operation, "Circuit breaker is open, skipping oracle call");
            observability::update_circuit_breaker_state(true);
            return Err(OracleError::CircuitOpen);
        }
        observability::update_circuit_breaker_state(false);

        let recovery = &self.config.recovery;
        let mut attempt = 0;
        let max_attempts = recovery.max_retries + 1;

        loop {
            attempt += 1;

            match self.send_once(api_key, request).await {
                Ok(text) => {
                    self.breaker.record_success();
                    observability::update_circuit_breaker_state(false);
                    observability::record_oracle_metrics(
                        operation,
                        true,
                        start_time.elapsed(),
                        attempt,
                    );
                    info!(
                        operation = %operation,
                        attempt,
                        duration_ms = start_time.elapsed().as_millis() as u64,
                        reply_chars = text.len(),
                        "Oracle call completed"
                    );
                    return Ok(text);
                }
                Err(err) => {
                    if attempt >= max_attempts || !err.is_retryable() {
                        self.breaker.record_failure();
                        observability::update_circuit_breaker_state(self.breaker.is_open());
                        observability::record_oracle_metrics(
                            operation,
                            false,
                            start_time.elapsed(),
                            attempt,
                        );
                        error_logging::log_oracle_error(
                            &err,
                            operation,
                            Some(&self.endpoint()),
                            Some(attempt),
                        );
                        return Err(err);
                    }

                    let delay_ms = calculate_retry_delay(attempt, recovery);
                    warn!("Oracle attempt {attempt} failed: {err}. Retrying in {delay_ms}ms");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn send_once(
        &self,
        api_key: &str,
        request: &MessagesRequest,
    ) -> Result<String, OracleError> {
        let timeout_secs = self.config.recovery.operation_timeout_secs;

        let response = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let response = self
                .http
                .post(self.endpoint())
                .header("x-api-key", api_key)
                .header("anthropic-version", &self.config.api_version)
                .json(request)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(OracleError::Http {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response.json::<MessagesResponse>().await?)
        })
        .await
        .map_err(|_| OracleError::Timeout(timeout_secs))??;

        debug!(blocks = response.content.len(), "Oracle reply received");

        response
            .content
            .into_iter()
            .find(|block| block.kind == "text")
            .and_then(|block| block.text)
            .ok_or_else(|| OracleError::Parse("Reply has no text content".to_string()))
    }
}

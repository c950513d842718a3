use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation is unavailable: {0}")]
    Unavailable(String),
    #[error("generation transport error: {0}")]
    Transport(String),
    #[error("generation endpoint returned status {0}")]
    Http(u16),
    #[error("generation response unreadable: {0}")]
    Parse(String),
    #[error("generation returned no text")]
    Empty,
    #[error("generation circuit open")]
    CircuitOpen,
}

/// Opaque text-generation capability.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

/// Generator for offline runs: every call fails as unavailable.
pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(
            "generation.mode=disabled".to_string(),
        ))
    }
}

pub fn from_config(cfg: &wombat_config::Generation) -> Result<Arc<dyn Generator>, String> {
    match cfg.mode.as_str() {
        "http" => Ok(Arc::new(HttpGenerator::new(cfg)?)),
        _ => Ok(Arc::new(DisabledGenerator)),
    }
}

/// `generateContent`-style JSON generator with retries and a circuit breaker.
pub struct HttpGenerator {
    endpoint: String,
    api_key: Option<String>,
    retry_max_attempts: usize,
    retry_backoff: Duration,
    circuit_breaker_failures: u64,
    circuit_breaker_open: Duration,
    failure_streak: Arc<Mutex<u64>>,
    circuit_open_until: Arc<Mutex<Option<Instant>>>,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl HttpGenerator {
    pub fn new(cfg: &wombat_config::Generation) -> Result<Self, String> {
        let endpoint = cfg
            .endpoint
            .clone()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| "generation.endpoint is required for http generation".to_string())?;
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(|e| e.to_string())?;
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|v| !v.is_empty());
        if api_key.is_none() {
            warn!(
                env = %cfg.api_key_env,
                "generation api key not set; calling endpoint without one"
            );
        }
        Ok(Self {
            endpoint,
            api_key,
            retry_max_attempts: cfg.retry_max_attempts.max(1),
            retry_backoff: Duration::from_millis(cfg.retry_backoff_ms),
            circuit_breaker_failures: cfg.circuit_breaker_failures.max(1),
            circuit_breaker_open: Duration::from_millis(cfg.circuit_breaker_open_ms.max(1)),
            failure_streak: Arc::new(Mutex::new(0)),
            circuit_open_until: Arc::new(Mutex::new(None)),
            client,
        })
    }

    async fn attempt(&self, prompt: &str) -> Result<String, GenerationError> {
        let body = json!({ "contents": [{ "parts": [{ "text": prompt }] }] });
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| GenerationError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(GenerationError::Http(response.status().as_u16()));
        }
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::Parse(e.to_string()))?;
        first_text(parsed)
    }

    async fn record_failure(&self) {
        let mut streak = self.failure_streak.lock().await;
        *streak += 1;
        if *streak >= self.circuit_breaker_failures {
            let mut open_until = self.circuit_open_until.lock().await;
            *open_until = Some(Instant::now() + self.circuit_breaker_open);
            warn!(failures = *streak, "generation circuit opened");
        }
    }

    async fn record_success(&self) {
        let mut streak = self.failure_streak.lock().await;
        *streak = 0;
        let mut open_until = self.circuit_open_until.lock().await;
        *open_until = None;
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        {
            let open_until = self.circuit_open_until.lock().await;
            if let Some(until) = *open_until {
                if until > Instant::now() {
                    return Err(GenerationError::CircuitOpen);
                }
            }
        }

        let mut last_failure = GenerationError::Empty;
        for attempt in 0..self.retry_max_attempts {
            match self.attempt(prompt).await {
                Ok(text) => {
                    self.record_success().await;
                    return Ok(text);
                }
                // A well-formed answer with no text will not improve on retry.
                Err(GenerationError::Empty) => {
                    last_failure = GenerationError::Empty;
                    break;
                }
                Err(e) => {
                    debug!(attempt = attempt + 1, error = %e, "generation attempt failed");
                    last_failure = e;
                    if attempt + 1 < self.retry_max_attempts && self.retry_backoff > Duration::ZERO
                    {
                        sleep(self.retry_backoff).await;
                    }
                }
            }
        }
        self.record_failure().await;
        Err(last_failure)
    }
}

fn first_text(response: GenerateResponse) -> Result<String, GenerationError> {
    response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .and_then(|c| c.parts.into_iter().next())
        .and_then(|p| p.text)
        .filter(|t| !t.trim().is_empty())
        .ok_or(GenerationError::Empty)
}

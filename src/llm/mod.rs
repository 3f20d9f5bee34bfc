pub mod models;
pub mod prompt;
pub mod providers;

use crate::config::LlmConfig;
use crate::error::PipelineError;
use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum LlmError {
    ConnectionError(String),
    ResponseError(String),
    ConfigError(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::ConnectionError(msg) => write!(f, "LLM connection error: {}", msg),
            LlmError::ResponseError(msg) => write!(f, "LLM response error: {}", msg),
            LlmError::ConfigError(msg) => write!(f, "LLM configuration error: {}", msg),
        }
    }
}

impl Error for LlmError {}

/// A text-in/text-out model endpoint. The model is an untrusted producer:
/// nothing downstream believes anything it says without re-checking.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Wraps the configured backend with admission control and a single
/// bounded retry. Returns the raw reply text; decoding against the
/// output contract happens in the pipeline.
pub struct LlmManager {
    backend: Box<dyn CompletionBackend>,
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
    retry_backoff: Duration,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let backend: Box<dyn CompletionBackend> = match config.backend.as_str() {
            "remote" => Box::new(providers::remote::RemoteLlmProvider::new(config)?),
            "ollama" => Box::new(providers::ollama::OllamaProvider::new(config)?),
            _ => {
                return Err(LlmError::ConfigError(format!(
                    "Unsupported LLM backend: {}",
                    config.backend
                )))
            }
        };

        Ok(Self::with_backend(
            backend,
            config.max_concurrency,
            Duration::from_millis(config.queue_timeout_ms),
        ))
    }

    pub fn with_backend(
        backend: Box<dyn CompletionBackend>,
        max_concurrency: usize,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            queue_timeout,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// One model call under the concurrency budget. Transport failures get
    /// exactly one retry after a short backoff; everything else is final.
    pub async fn complete(&self, prompt: &str) -> Result<String, PipelineError> {
        let _permit = tokio::time::timeout(self.queue_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| {
                PipelineError::Upstream("model endpoint saturated, queue wait expired".to_string())
            })?
            .map_err(|e| PipelineError::Upstream(e.to_string()))?;

        match self.backend.complete(prompt).await {
            Ok(text) => Ok(text),
            Err(LlmError::ConnectionError(first)) => {
                warn!("model call failed, retrying once: {}", first);
                tokio::time::sleep(self.retry_backoff).await;
                match self.backend.complete(prompt).await {
                    Ok(text) => {
                        debug!("retry succeeded");
                        Ok(text)
                    }
                    Err(e) => Err(PipelineError::Upstream(format!(
                        "retry failed: {} (first attempt: {})",
                        e, first
                    ))),
                }
            }
            Err(e) => Err(PipelineError::Upstream(e.to_string())),
        }
    }
}

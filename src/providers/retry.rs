//! Retry provider: a decorator that retries transient backend failures.
//!
//! Only errors classified as retryable (see
//! [`ProviderError::is_retryable`](crate::error::ProviderError::is_retryable))
//! are retried. Everything else is returned on the first failure.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use relayclaw::providers::RetryProvider;
//!
//! let provider = RetryProvider::new(Arc::new(my_backend))
//!     .with_max_retries(5)
//!     .with_base_delay_ms(500);
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{RelayError, Result};
use crate::session::Message;

use super::{ChatOptions, LLMProvider, LLMResponse, ToolDefinition};

/// Retries transient errors from the wrapped provider with exponential backoff.
pub struct RetryProvider {
    inner: Arc<dyn LLMProvider>,
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl std::fmt::Debug for RetryProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryProvider")
            .field("inner", &self.inner.name())
            .field("max_retries", &self.max_retries)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("max_delay_ms", &self.max_delay_ms)
            .finish()
    }
}

impl RetryProvider {
    /// Wraps `inner` with 3 retries, 1s base delay, 30s cap.
    pub fn new(inner: Arc<dyn LLMProvider>) -> Self {
        Self::from_config(inner, &RetryConfig::default())
    }

    pub fn from_config(inner: Arc<dyn LLMProvider>, config: &RetryConfig) -> Self {
        Self {
            inner,
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
        }
    }

    /// Wraps `inner` only when retries are enabled in `config`.
    pub fn wrap(inner: Arc<dyn LLMProvider>, config: &RetryConfig) -> Arc<dyn LLMProvider> {
        if config.enabled && config.max_retries > 0 {
            Arc::new(Self::from_config(inner, config))
        } else {
            inner
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// The delay before retry `n` is `min(base * 2^n + jitter, max)`.
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }
}

/// Whether `err` is a transient backend failure.
pub fn is_retryable(err: &RelayError) -> bool {
    match err {
        RelayError::ProviderTyped(pe) => pe.is_retryable(),
        _ => false,
    }
}

/// Backoff delay for `attempt` (0-indexed) with the given jitter.
pub fn compute_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64, jitter_ms: u64) -> u64 {
    let exponential = base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    exponential.saturating_add(jitter_ms).min(max_delay_ms)
}

/// Sleep for the backoff delay of `attempt`.
///
/// Jitter comes from the random bits of a v4 UUID, bounded by the base delay.
async fn delay_with_jitter(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) {
    let jitter_ms = (uuid::Uuid::new_v4().as_u128() as u64) % base_delay_ms.max(1);
    let delay = compute_delay(attempt, base_delay_ms, max_delay_ms, jitter_ms);
    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
}

#[async_trait]
impl LLMProvider for RetryProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Vec<ToolDefinition>,
        model: Option<&str>,
        options: ChatOptions,
    ) -> Result<LLMResponse> {
        let mut attempt = 0;
        loop {
            match self
                .inner
                .chat(messages.clone(), tools.clone(), model, options.clone())
                .await
            {
                Ok(response) => return Ok(response),
                Err(err) if attempt < self.max_retries && is_retryable(&err) => {
                    warn!(
                        provider = self.inner.name(),
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        error = %err,
                        "Retrying chat request after transient error"
                    );
                    delay_with_jitter(attempt, self.base_delay_ms, self.max_delay_ms).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

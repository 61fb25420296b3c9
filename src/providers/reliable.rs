use async_trait::async_trait;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::providers::traits::{ChatRequest, ChatResponse, Provider, SamplingParams};

/// Provider wrapper with transient-error retry behavior.
///
/// Retries apply only to transient errors (429, 5xx, network, per-attempt
/// timeouts). Authentication and 4xx schema errors are terminal and surface
/// immediately.
pub struct ReliableProvider {
    inner: Box<dyn Provider>,
    max_retries: u32,
    base_backoff_ms: u64,
}

impl ReliableProvider {
    pub fn new(inner: Box<dyn Provider>, max_retries: u32, base_backoff_ms: u64) -> Self {
        Self {
            inner,
            max_retries,
            base_backoff_ms: base_backoff_ms.max(50),
        }
    }
}

#[async_trait]
impl Provider for ReliableProvider {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        let mut backoff_ms = self.base_backoff_ms;
        let mut last_error: Option<EngineError> = None;

        for attempt in 0..=self.max_retries {
            match self.inner.chat(request.clone(), model, params).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            provider = self.inner.name(),
                            attempt,
                            "provider recovered after retries"
                        );
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if !e.is_transient() {
                        return Err(e);
                    }

                    if attempt < self.max_retries {
                        tracing::warn!(
                            provider = self.inner.name(),
                            attempt = attempt + 1,
                            max_retries = self.max_retries,
                            error = %e,
                            "transient provider error, retrying"
                        );
                        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                        backoff_ms = backoff_ms.saturating_mul(2).min(10_000);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| EngineError::ProviderTransient("retries exhausted".into())))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

//! Generic client for OpenAI-compatible chat-completions endpoints.
//!
//! Several providers (xAI/Grok among them) speak the OpenAI wire format at a
//! different base URL. This wrapper reuses the OpenAI transport and only
//! changes the endpoint and the display name used in logs and errors.

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::providers::openai::OpenAiProvider;
use crate::providers::traits::{ChatRequest, ChatResponse, Provider, SamplingParams};

pub struct OpenAiCompatibleProvider {
    display_name: String,
    inner: OpenAiProvider,
}

impl OpenAiCompatibleProvider {
    pub fn new(display_name: &str, base_url: &str, api_key: String) -> Self {
        Self {
            display_name: display_name.to_string(),
            inner: OpenAiProvider::new_with_url(api_key, base_url),
        }
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        self.inner.chat(request, model, params).await
    }

    fn name(&self) -> &str {
        &self.display_name
    }
}

pub mod anthropic;
pub mod compatible;
pub mod gemini;
pub mod openai;
pub mod reliable;
pub mod traits;

pub use reliable::ReliableProvider;
pub use traits::{
    ChatMessage, ChatRequest, ChatResponse, NativeCapability, Provider, SamplingParams,
    TokenUsage, ToolCall, ToolSpec,
};

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};

/// Split a model id of the form `provider:model` into its parts.
///
/// Every model id is explicit; there is no default provider and no default
/// model, so a bare name is a configuration error.
pub fn parse_model_id(model_id: &str) -> EngineResult<(&str, &str)> {
    match model_id.split_once(':') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            Ok((provider, model))
        }
        _ => Err(EngineError::Configuration(format!(
            "model id '{model_id}' must have the form 'provider:model' (e.g. 'anthropic:claude-sonnet-4-20250514')"
        ))),
    }
}

/// Environment variable holding the credential for a provider name.
pub fn credential_env_var(provider: &str) -> EngineResult<&'static str> {
    match provider {
        "anthropic" => Ok("ANTHROPIC_API_KEY"),
        "openai" => Ok("OPENAI_API_KEY"),
        "google" | "gemini" | "google-gla" => Ok("GOOGLE_API_KEY"),
        "grok" | "xai" => Ok("GROK_API_KEY"),
        _ => Err(EngineError::Configuration(format!(
            "unknown provider '{provider}'. Supported: anthropic, openai, google, grok"
        ))),
    }
}

fn read_credential(provider: &str) -> EngineResult<String> {
    let var = credential_env_var(provider)?;
    match std::env::var(var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => {
            // The only fallback policy is to refuse. A missing key is a typed
            // error raised before any round runs, never a mock substitution.
            let mut message = format!("{var} is not set");
            if matches!(provider, "google" | "gemini" | "google-gla")
                && std::env::var("GOOGLE_GENAI_USE_VERTEXAI").is_ok()
            {
                message.push_str(
                    "; GOOGLE_GENAI_USE_VERTEXAI is set but Vertex ADC still requires \
                     GOOGLE_API_KEY for this transport",
                );
            }
            Err(EngineError::Authentication {
                provider: provider.to_string(),
                message,
            })
        }
    }
}

/// Construct a bare provider client for `provider` using env credentials.
fn create_provider(provider: &str) -> EngineResult<Box<dyn Provider>> {
    let key = read_credential(provider)?;
    match provider {
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(key))),
        "openai" => Ok(Box::new(openai::OpenAiProvider::new(key))),
        "google" | "gemini" | "google-gla" => Ok(Box::new(gemini::GeminiProvider::new(key))),
        "grok" | "xai" => Ok(Box::new(compatible::OpenAiCompatibleProvider::new(
            "grok",
            "https://api.x.ai",
            key,
        ))),
        _ => Err(EngineError::Configuration(format!(
            "unknown provider '{provider}'"
        ))),
    }
}

/// Shared, authenticated model-client factory keyed by model id.
///
/// The leader, every member, the evaluator, and the judge all resolve their
/// clients through one factory instance so an execution authenticates each
/// provider exactly once. Clients are wrapped in [`ReliableProvider`] with the
/// configured transient-retry budget.
pub struct ProviderFactory {
    max_retries: u32,
    base_backoff_ms: u64,
    cache: Mutex<HashMap<String, Arc<dyn Provider>>>,
}

impl ProviderFactory {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_backoff_ms: 200,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve (or create and cache) the client for `model_id`, returning the
    /// client together with the bare model name to pass on each request.
    pub fn client_for(&self, model_id: &str) -> EngineResult<(Arc<dyn Provider>, String)> {
        let (provider, model) = parse_model_id(model_id)?;

        let mut cache = self.cache.lock();
        if let Some(client) = cache.get(provider) {
            return Ok((Arc::clone(client), model.to_string()));
        }

        let client: Arc<dyn Provider> = Arc::new(ReliableProvider::new(
            create_provider(provider)?,
            self.max_retries,
            self.base_backoff_ms,
        ));
        cache.insert(provider.to_string(), Arc::clone(&client));
        Ok((client, model.to_string()))
    }

    /// Pre-register a client for a provider name, bypassing env credentials.
    /// Test seam: scripted providers are injected here so the kernel paths
    /// run unmodified.
    pub fn register(&self, provider: &str, client: Arc<dyn Provider>) {
        self.cache.lock().insert(provider.to_string(), client);
    }
}

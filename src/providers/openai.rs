use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{provider_error_from_reqwest, provider_error_from_status, EngineError, EngineResult};
use crate::providers::traits::{
    ChatRequest, ChatResponse, NativeCapability, Provider, SamplingParams, TokenUsage, ToolCall,
};

const OPENAI_API_BASE: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CompletionsRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<WireToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(api_key: String) -> Self {
        Self::new_with_url(api_key, OPENAI_API_BASE)
    }

    pub fn new_with_url(api_key: String, base_url: &str) -> Self {
        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn supports_custom_temperature(model: &str) -> bool {
        // The gpt-5 family only supports default temperature behavior.
        !model.starts_with("gpt-5")
    }

    fn request_temperature(model: &str, temperature: f64) -> Option<f64> {
        if Self::supports_custom_temperature(model) {
            Some(temperature)
        } else {
            None
        }
    }

    fn convert_messages(messages: &[crate::providers::ChatMessage]) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|msg| WireMessage {
                role: msg.role.clone(),
                content: msg.content.clone(),
                tool_calls: if msg.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        msg.tool_calls
                            .iter()
                            .map(|c| WireToolCall {
                                id: c.id.clone(),
                                kind: "function".into(),
                                function: WireFunctionCall {
                                    name: c.name.clone(),
                                    arguments: c.arguments.clone(),
                                },
                            })
                            .collect(),
                    )
                },
                tool_call_id: msg.tool_call_id.clone(),
            })
            .collect()
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        if let Some(capability) = request.capability {
            // Chat-completions has no hosted search/sandbox tools; refusing is
            // required rather than silently answering without the capability.
            let label = match capability {
                NativeCapability::WebSearch => "web_search",
                NativeCapability::CodeExecution => "code_execution",
            };
            return Err(EngineError::ProviderPermanent(format!(
                "OpenAI chat completions does not support the native {label} capability"
            )));
        }

        let body = CompletionsRequest {
            model: model.to_string(),
            messages: Self::convert_messages(request.messages),
            temperature: Self::request_temperature(model, params.temperature),
            max_completion_tokens: params.max_tokens,
            seed: params.seed,
            tools: request
                .tools
                .iter()
                .map(|t| WireTool {
                    kind: "function".into(),
                    function: WireFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    },
                })
                .collect(),
        };

        let endpoint = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(provider_error_from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(provider_error_from_status(status.as_u16(), &error));
        }

        let parsed: CompletionsResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderPermanent(format!("OpenAI response decode: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderPermanent("OpenAI returned no choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| ToolCall {
                id: c.id,
                name: c.function.name,
                arguments: c.function.arguments,
            })
            .collect();

        let usage = parsed
            .usage
            .map(|u| TokenUsage::single_request(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_else(|| TokenUsage::single_request(0, 0));

        Ok(ChatResponse {
            text: choice.message.content.filter(|t| !t.is_empty()),
            tool_calls,
            usage,
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

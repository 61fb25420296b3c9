use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{provider_error_from_reqwest, provider_error_from_status, EngineError, EngineResult};
use crate::providers::traits::{
    ChatRequest, ChatResponse, NativeCapability, Provider, SamplingParams, TokenUsage, ToolCall,
};

/// Default Anthropic API base URL
const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

pub struct AnthropicProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    temperature: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireTool {
    Function {
        name: String,
        description: String,
        input_schema: serde_json::Value,
    },
    Server {
        #[serde(rename = "type")]
        kind: String,
        name: String,
    },
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    /// Build a configured HTTP client
    fn build_client() -> Client {
        Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new())
    }

    pub fn new(api_key: String) -> Self {
        Self::new_with_url(api_key, ANTHROPIC_API_BASE)
    }

    /// Create provider with custom base URL (Anthropic-compatible endpoints).
    pub fn new_with_url(api_key: String, base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Self::build_client(),
        }
    }

    fn convert_messages(messages: &[crate::providers::ChatMessage]) -> (Option<String>, Vec<WireMessage>) {
        let mut system = None;
        let mut wire = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => system = Some(msg.content.clone()),
                "assistant" => {
                    let mut content = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(WireContentBlock::Text {
                            text: msg.content.clone(),
                        });
                    }
                    for call in &msg.tool_calls {
                        content.push(WireContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: serde_json::from_str(&call.arguments)
                                .unwrap_or(serde_json::Value::Null),
                        });
                    }
                    wire.push(WireMessage {
                        role: "assistant".into(),
                        content,
                    });
                }
                "tool" => wire.push(WireMessage {
                    role: "user".into(),
                    content: vec![WireContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone(),
                    }],
                }),
                _ => wire.push(WireMessage {
                    role: "user".into(),
                    content: vec![WireContentBlock::Text {
                        text: msg.content.clone(),
                    }],
                }),
            }
        }

        (system, wire)
    }

    fn server_tool(capability: NativeCapability) -> WireTool {
        match capability {
            NativeCapability::WebSearch => WireTool::Server {
                kind: "web_search_20250305".into(),
                name: "web_search".into(),
            },
            NativeCapability::CodeExecution => WireTool::Server {
                kind: "code_execution_20250522".into(),
                name: "code_execution".into(),
            },
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        let (system, messages) = Self::convert_messages(request.messages);

        let mut tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool::Function {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();
        if let Some(capability) = request.capability {
            tools.push(Self::server_tool(capability));
        }

        let body = MessagesRequest {
            model: model.to_string(),
            max_tokens: params.max_tokens,
            system,
            messages,
            temperature: params.temperature,
            tools,
        };

        let endpoint = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&endpoint)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(provider_error_from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(provider_error_from_status(status.as_u16(), &error));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderPermanent(format!("Anthropic response decode: {e}")))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ResponseBlock::Text { text: t } => text.push_str(&t),
                ResponseBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments: input.to_string(),
                }),
                ResponseBlock::Other => {}
            }
        }

        let usage = parsed
            .usage
            .map(|u| TokenUsage::single_request(u.input_tokens, u.output_tokens))
            .unwrap_or_else(|| TokenUsage::single_request(0, 0));

        Ok(ChatResponse {
            text: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            usage,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

//! Google Gemini provider.
//!
//! Authenticates with an API key (`GOOGLE_API_KEY`) or, when
//! `GOOGLE_GENAI_USE_VERTEXAI` is set, defers to application-default
//! credentials configured via `GOOGLE_APPLICATION_CREDENTIALS`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{provider_error_from_reqwest, provider_error_from_status, EngineError, EngineResult};
use crate::providers::traits::{
    ChatRequest, ChatResponse, NativeCapability, Provider, SamplingParams, TokenUsage, ToolCall,
};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    api_key: String,
    client: Client,
    base_url: String,
}

// ── API request/response types ───────────────────────────────────

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireToolGroup>,
}

#[derive(Debug, Serialize)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    function_call: Option<WireFunctionCall>,
    #[serde(rename = "functionResponse", skip_serializing_if = "Option::is_none")]
    function_response: Option<WireFunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireFunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WireToolGroup {
    #[serde(rename = "functionDeclarations", skip_serializing_if = "Vec::is_empty")]
    function_declarations: Vec<WireFunctionDeclaration>,
    #[serde(rename = "googleSearch", skip_serializing_if = "Option::is_none")]
    google_search: Option<serde_json::Value>,
    #[serde(rename = "codeExecution", skip_serializing_if = "Option::is_none")]
    code_execution: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireFunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
    #[serde(rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

impl GeminiProvider {
    pub fn new(api_key: String) -> Self {
        Self::new_with_url(api_key, GEMINI_API_BASE)
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

    fn convert_messages(messages: &[crate::providers::ChatMessage]) -> (Option<Content>, Vec<Content>) {
        let mut system_instruction = None;
        let mut contents = Vec::new();

        for msg in messages {
            match msg.role.as_str() {
                "system" => {
                    system_instruction = Some(Content {
                        role: None,
                        parts: vec![Part {
                            text: Some(msg.content.clone()),
                            function_call: None,
                            function_response: None,
                        }],
                    });
                }
                "assistant" => {
                    let mut parts = Vec::new();
                    if !msg.content.is_empty() {
                        parts.push(Part {
                            text: Some(msg.content.clone()),
                            function_call: None,
                            function_response: None,
                        });
                    }
                    for call in &msg.tool_calls {
                        parts.push(Part {
                            text: None,
                            function_call: Some(WireFunctionCall {
                                name: call.name.clone(),
                                args: serde_json::from_str(&call.arguments)
                                    .unwrap_or(serde_json::Value::Null),
                            }),
                            function_response: None,
                        });
                    }
                    contents.push(Content {
                        role: Some("model".into()),
                        parts,
                    });
                }
                "tool" => {
                    // Gemini keys function responses by function name. Call
                    // ids are synthesized as "name:index", so strip the index.
                    let call_id = msg.tool_call_id.clone().unwrap_or_default();
                    let function_name = call_id.split(':').next().unwrap_or_default().to_string();
                    contents.push(Content {
                        role: Some("user".into()),
                        parts: vec![Part {
                            text: None,
                            function_call: None,
                            function_response: Some(WireFunctionResponse {
                                name: function_name,
                                response: serde_json::json!({ "output": msg.content }),
                            }),
                        }],
                    });
                }
                _ => contents.push(Content {
                    role: Some("user".into()),
                    parts: vec![Part {
                        text: Some(msg.content.clone()),
                        function_call: None,
                        function_response: None,
                    }],
                }),
            }
        }

        (system_instruction, contents)
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        let (system_instruction, contents) = Self::convert_messages(request.messages);

        let mut tools = Vec::new();
        if !request.tools.is_empty() {
            tools.push(WireToolGroup {
                function_declarations: request
                    .tools
                    .iter()
                    .map(|t| WireFunctionDeclaration {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.parameters.clone(),
                    })
                    .collect(),
                google_search: None,
                code_execution: None,
            });
        }
        match request.capability {
            Some(NativeCapability::WebSearch) => tools.push(WireToolGroup {
                function_declarations: vec![],
                google_search: Some(serde_json::json!({})),
                code_execution: None,
            }),
            Some(NativeCapability::CodeExecution) => tools.push(WireToolGroup {
                function_declarations: vec![],
                google_search: None,
                code_execution: Some(serde_json::json!({})),
            }),
            None => {}
        }

        let body = GenerateContentRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: params.temperature,
                max_output_tokens: params.max_tokens,
                seed: params.seed,
            },
            tools,
        };

        let endpoint = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, model, self.api_key
        );
        let response = self
            .client
            .post(&endpoint)
            .json(&body)
            .send()
            .await
            .map_err(provider_error_from_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let error = response.text().await.unwrap_or_default();
            return Err(provider_error_from_status(status.as_u16(), &error));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| EngineError::ProviderPermanent(format!("Gemini response decode: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(EngineError::ProviderPermanent(format!(
                "Gemini API error: {}",
                error.message
            )));
        }

        let candidate = parsed
            .candidates
            .and_then(|mut c| if c.is_empty() { None } else { Some(c.remove(0)) })
            .ok_or_else(|| EngineError::ProviderPermanent("Gemini returned no candidates".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for (index, part) in candidate.content.parts.into_iter().enumerate() {
            if let Some(t) = part.text {
                text.push_str(&t);
            }
            if let Some(call) = part.function_call {
                tool_calls.push(ToolCall {
                    // Gemini does not mint call ids; synthesize stable ones.
                    id: format!("{}:{}", call.name, index),
                    name: call.name,
                    arguments: call.args.to_string(),
                });
            }
        }

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage::single_request(u.prompt_token_count, u.candidates_token_count))
            .unwrap_or_else(|| TokenUsage::single_request(0, 0));

        Ok(ChatResponse {
            text: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            usage,
        })
    }

    fn name(&self) -> &str {
        "google"
    }
}

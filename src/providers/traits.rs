use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;

/// One message in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// Tool calls the assistant emitted in this turn, if any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For role="tool": the id of the call this message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// A tool call emitted by the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments string, exactly as the provider returned it.
    pub arguments: String,
}

/// Tool made available to the model for function calling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Provider-reported token accounting for a single call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub requests: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.requests += other.requests;
    }

    pub fn single_request(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            requests: 1,
        }
    }
}

/// Provider-native capability a request may enable. Providers that do not
/// support the capability must refuse with a permanent error, never silently
/// degrade to plain text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeCapability {
    /// Provider-hosted web search (retrieved passages folded into the answer).
    WebSearch,
    /// Provider-hosted code execution sandbox.
    CodeExecution,
}

/// One model request: full history plus the tools the model may call.
#[derive(Debug, Clone)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: &'a [ToolSpec],
    pub capability: Option<NativeCapability>,
}

impl<'a> ChatRequest<'a> {
    pub fn new(messages: &'a [ChatMessage]) -> Self {
        Self {
            messages,
            tools: &[],
            capability: None,
        }
    }

    pub fn with_tools(messages: &'a [ChatMessage], tools: &'a [ToolSpec]) -> Self {
        Self {
            messages,
            tools,
            capability: None,
        }
    }

    pub fn with_capability(messages: &'a [ChatMessage], capability: NativeCapability) -> Self {
        Self {
            messages,
            tools: &[],
            capability: Some(capability),
        }
    }
}

/// What the model returned for one request.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: TokenUsage,
}

/// Sampling parameters forwarded to the provider verbatim.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f64,
    pub max_tokens: u32,
    /// Deterministic seed, honored when the provider supports one.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 4096,
            seed: None,
        }
    }
}

/// Uniform interface to LLM providers: issue a request, report token usage.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Full conversation request with optional function calling.
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse>;

    /// Single prompt → response convenience used by the evaluator and judge.
    async fn chat_with_system(
        &self,
        system_prompt: Option<&str>,
        message: &str,
        model: &str,
        params: SamplingParams,
    ) -> EngineResult<ChatResponse> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user(message));
        self.chat(ChatRequest::new(&messages), model, params).await
    }

    /// Provider display name for logs and error surfaces.
    fn name(&self) -> &str;
}

//! Member agents: the specialists a leader can delegate to.
//!
//! Four capabilities: `plain` (text in, text out), `web_search` and
//! `code_exec` (backed by provider-native tools), and `custom`
//! (a user-supplied subprocess speaking line-delimited JSON over stdio).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::config::MemberSpec;
use crate::error::{EngineError, EngineResult};
use crate::providers::{
    ChatMessage, ChatRequest, NativeCapability, Provider, ProviderFactory, SamplingParams,
    TokenUsage,
};

/// Output of one member invocation: the text produced and the usage it cost.
#[derive(Debug, Clone)]
pub struct MemberOutput {
    pub content: String,
    pub usage: TokenUsage,
}

/// A member agent bound to one team slot.
#[async_trait]
pub trait MemberAgent: Send + Sync {
    async fn run(&self, task: &str) -> EngineResult<MemberOutput>;
}

/// Resolve a member spec into a runnable agent. Provider credentials are
/// checked here, at construction, so a missing key surfaces before any
/// round runs.
pub fn create_member_agent(
    spec: &MemberSpec,
    factory: &ProviderFactory,
) -> EngineResult<Box<dyn MemberAgent>> {
    match spec.agent_type.as_str() {
        "plain" => Ok(Box::new(ModelMember::new(spec, factory, None)?)),
        "web_search" => Ok(Box::new(ModelMember::new(
            spec,
            factory,
            Some(NativeCapability::WebSearch),
        )?)),
        "code_exec" => Ok(Box::new(ModelMember::new(
            spec,
            factory,
            Some(NativeCapability::CodeExecution),
        )?)),
        "custom" => {
            let command = spec.plugin_command.clone().ok_or_else(|| {
                EngineError::Configuration(format!(
                    "custom member '{}' requires plugin_command",
                    spec.agent_name
                ))
            })?;
            Ok(Box::new(SubprocessMember {
                agent_name: spec.agent_name.clone(),
                command,
            }))
        }
        other => Err(EngineError::Configuration(format!(
            "unknown agent_type '{other}' for member '{}'",
            spec.agent_name
        ))),
    }
}

// ── Model-backed members (plain / web_search / code_exec) ────────

struct ModelMember {
    client: Arc<dyn Provider>,
    model: String,
    params: SamplingParams,
    system_instruction: Option<String>,
    capability: Option<NativeCapability>,
}

impl ModelMember {
    fn new(
        spec: &MemberSpec,
        factory: &ProviderFactory,
        capability: Option<NativeCapability>,
    ) -> EngineResult<Self> {
        let (client, model) = factory.client_for(&spec.params.model)?;
        Ok(Self {
            client,
            model,
            params: SamplingParams {
                temperature: spec.params.temperature,
                max_tokens: spec.params.max_tokens,
                seed: None,
            },
            system_instruction: spec.params.system_instruction.clone(),
            capability,
        })
    }
}

#[async_trait]
impl MemberAgent for ModelMember {
    async fn run(&self, task: &str) -> EngineResult<MemberOutput> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system_instruction {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(task));

        let mut request = ChatRequest::new(&messages);
        request.capability = self.capability;

        let response = self.client.chat(request, &self.model, self.params).await?;
        let content = response.text.unwrap_or_default();
        if content.trim().is_empty() {
            return Err(EngineError::ProviderPermanent(
                "member returned an empty response".into(),
            ));
        }
        Ok(MemberOutput {
            content,
            usage: response.usage,
        })
    }
}

// ── Custom members (out-of-process plugins) ──────────────────────

/// Request line written to a custom member's stdin.
#[derive(Debug, Serialize)]
struct PluginRequest<'a> {
    version: u32,
    task: &'a str,
}

/// Response line expected on the plugin's stdout.
#[derive(Debug, Deserialize)]
struct PluginResponse {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Out-of-process member: spawn the configured command, write one JSON
/// request line, read one JSON response line. Crash isolation comes free;
/// `kill_on_drop` releases the child on every exit path, including
/// cooperative cancellation of the round.
struct SubprocessMember {
    agent_name: String,
    command: String,
}

impl SubprocessMember {
    fn split_command(&self) -> EngineResult<(String, Vec<String>)> {
        let mut parts = self.command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            EngineError::Configuration(format!(
                "custom member '{}' has an empty plugin_command",
                self.agent_name
            ))
        })?;
        Ok((program, parts.collect()))
    }
}

#[async_trait]
impl MemberAgent for SubprocessMember {
    async fn run(&self, task: &str) -> EngineResult<MemberOutput> {
        let (program, args) = self.split_command()?;

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::ProviderPermanent(format!(
                    "failed to spawn custom member '{}' (`{}`): {e}",
                    self.agent_name, self.command
                ))
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            EngineError::ProviderPermanent(format!(
                "custom member '{}' has no stdin",
                self.agent_name
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::ProviderPermanent(format!(
                "custom member '{}' has no stdout",
                self.agent_name
            ))
        })?;

        let request = serde_json::to_string(&PluginRequest { version: 1, task })
            .map_err(|e| EngineError::ProviderPermanent(format!("encode plugin request: {e}")))?;
        stdin
            .write_all(request.as_bytes())
            .await
            .map_err(|e| plugin_io_error(&self.agent_name, e))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| plugin_io_error(&self.agent_name, e))?;
        stdin
            .shutdown()
            .await
            .map_err(|e| plugin_io_error(&self.agent_name, e))?;
        // Close the pipe so plugins that read to EOF see it.
        drop(stdin);

        let mut line = String::new();
        BufReader::new(stdout)
            .read_line(&mut line)
            .await
            .map_err(|e| plugin_io_error(&self.agent_name, e))?;

        let status = child
            .wait()
            .await
            .map_err(|e| plugin_io_error(&self.agent_name, e))?;
        if line.trim().is_empty() {
            return Err(EngineError::ProviderPermanent(format!(
                "custom member '{}' exited ({status}) without a response line",
                self.agent_name
            )));
        }

        let response: PluginResponse = serde_json::from_str(line.trim()).map_err(|e| {
            EngineError::ProviderPermanent(format!(
                "custom member '{}' returned invalid JSON: {e}",
                self.agent_name
            ))
        })?;

        if let Some(error) = response.error {
            return Err(EngineError::ProviderPermanent(format!(
                "custom member '{}' reported: {error}",
                self.agent_name
            )));
        }
        let content = response.content.unwrap_or_default();
        if content.is_empty() {
            return Err(EngineError::ProviderPermanent(format!(
                "custom member '{}' returned no content",
                self.agent_name
            )));
        }

        Ok(MemberOutput {
            content,
            usage: TokenUsage {
                input_tokens: response.input_tokens,
                output_tokens: response.output_tokens,
                requests: 1,
            },
        })
    }
}

fn plugin_io_error(agent_name: &str, e: std::io::Error) -> EngineError {
    EngineError::ProviderPermanent(format!("custom member '{agent_name}' I/O failed: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentParams;
    use crate::providers::{ChatResponse, Provider};
    use parking_lot::Mutex;

    struct RecordingProvider {
        last_capability: Mutex<Option<NativeCapability>>,
        reply: String,
    }

    #[async_trait]
    impl Provider for RecordingProvider {
        async fn chat(
            &self,
            request: ChatRequest<'_>,
            _model: &str,
            _params: SamplingParams,
        ) -> EngineResult<ChatResponse> {
            *self.last_capability.lock() = request.capability;
            Ok(ChatResponse {
                text: Some(self.reply.clone()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(4, 8),
            })
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    fn spec(agent_type: &str) -> MemberSpec {
        MemberSpec {
            agent_name: "analyst".into(),
            agent_type: agent_type.into(),
            tool_name: "delegate_to_analyst".into(),
            tool_description: "analyzes text".into(),
            params: AgentParams {
                model: "recording:test-model".into(),
                temperature: 0.5,
                max_tokens: 1024,
                system_instruction: Some("be factual".into()),
            },
            plugin_command: None,
        }
    }

    fn factory_with_recording(reply: &str) -> (ProviderFactory, Arc<RecordingProvider>) {
        let provider = Arc::new(RecordingProvider {
            last_capability: Mutex::new(None),
            reply: reply.to_string(),
        });
        let factory = ProviderFactory::new(0);
        factory.register("recording", provider.clone());
        (factory, provider)
    }

    #[tokio::test]
    async fn plain_member_returns_text_and_usage() {
        let (factory, provider) = factory_with_recording("the answer");
        let agent = create_member_agent(&spec("plain"), &factory).unwrap();
        let output = agent.run("analyze this").await.unwrap();
        assert_eq!(output.content, "the answer");
        assert_eq!(output.usage.requests, 1);
        assert_eq!(*provider.last_capability.lock(), None);
    }

    #[tokio::test]
    async fn web_search_member_requests_native_capability() {
        let (factory, provider) = factory_with_recording("found it");
        let agent = create_member_agent(&spec("web_search"), &factory).unwrap();
        agent.run("find the source").await.unwrap();
        assert_eq!(
            *provider.last_capability.lock(),
            Some(NativeCapability::WebSearch)
        );
    }

    #[tokio::test]
    async fn code_exec_member_requests_sandbox_capability() {
        let (factory, provider) = factory_with_recording("ran it");
        let agent = create_member_agent(&spec("code_exec"), &factory).unwrap();
        agent.run("compute 2+2").await.unwrap();
        assert_eq!(
            *provider.last_capability.lock(),
            Some(NativeCapability::CodeExecution)
        );
    }

    #[tokio::test]
    async fn empty_model_reply_is_an_error() {
        let (factory, _) = factory_with_recording("   ");
        let agent = create_member_agent(&spec("plain"), &factory).unwrap();
        let err = agent.run("task").await.unwrap_err();
        assert_eq!(err.kind(), "provider_permanent");
    }

    #[test]
    fn unknown_agent_type_is_configuration_error() {
        let (factory, _) = factory_with_recording("x");
        let err = match create_member_agent(&spec("psychic"), &factory) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), "configuration");
    }

    #[test]
    fn custom_member_without_command_is_rejected() {
        let (factory, _) = factory_with_recording("x");
        let err = match create_member_agent(&spec("custom"), &factory) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert_eq!(err.kind(), "configuration");
    }

    #[tokio::test]
    async fn custom_member_round_trips_json_over_stdio() {
        // A tiny shell plugin: read one request line, answer one response line.
        let member = SubprocessMember {
            agent_name: "plugin".into(),
            command: format!(
                "sh {}",
                write_plugin_script(
                    r#"read line
echo '{"content":"plugin says hi","input_tokens":3,"output_tokens":5}'"#
                )
            ),
        };

        let output = member.run("do the thing").await.unwrap();
        assert_eq!(output.content, "plugin says hi");
        assert_eq!(output.usage.input_tokens, 3);
        assert_eq!(output.usage.output_tokens, 5);
        assert_eq!(output.usage.requests, 1);
    }

    #[tokio::test]
    async fn custom_member_error_field_fails_the_member() {
        let member = SubprocessMember {
            agent_name: "plugin".into(),
            command: format!(
                "sh {}",
                write_plugin_script(
                    r#"read line
echo '{"error":"no can do"}'"#
                )
            ),
        };
        let err = member.run("task").await.unwrap_err();
        assert!(err.to_string().contains("no can do"));
    }

    #[tokio::test]
    async fn custom_member_invalid_json_fails() {
        let member = SubprocessMember {
            agent_name: "plugin".into(),
            command: format!(
                "sh {}",
                write_plugin_script(
                    r#"read line
echo 'not json at all'"#
                )
            ),
        };
        let err = member.run("task").await.unwrap_err();
        assert!(err.to_string().contains("invalid JSON"));
    }

    #[tokio::test]
    async fn custom_member_missing_binary_fails_to_spawn() {
        let member = SubprocessMember {
            agent_name: "plugin".into(),
            command: "/nonexistent/plugin-binary".into(),
        };
        let err = member.run("task").await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    /// Write a one-shot plugin script to a stable temp path and return it.
    fn write_plugin_script(body: &str) -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let path = std::env::temp_dir().join(format!(
            "mixseek-plugin-{}-{}.sh",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::write(&path, body).unwrap();
        path.to_string_lossy().into_owned()
    }
}

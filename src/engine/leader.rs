//! Leader agent: runs a conversation with its backing model and delegates
//! subtasks to members through bound tools.
//!
//! Each member is exposed as one tool whose name and description come from
//! the team configuration; the model's tool choices drive delegation. Every
//! tool invocation appends exactly one `MemberSubmission` in invocation
//! order, and a member failure is recorded rather than aborting the round;
//! the leader decides whether to compensate.

use std::sync::Arc;

use crate::config::TeamConfig;
use crate::engine::member::{create_member_agent, MemberAgent};
use crate::engine::types::MemberSubmission;
use crate::error::{EngineError, EngineResult};
use crate::providers::{
    ChatMessage, ChatRequest, Provider, ProviderFactory, SamplingParams, TokenUsage, ToolCall,
    ToolSpec,
};

/// Ceiling on leader conversation steps to prevent runaway tool loops.
const MAX_TOOL_ITERATIONS: usize = 10;

/// Version tag prepended to persisted message history blobs.
const MESSAGE_HISTORY_VERSION: u32 = 1;

/// What one leader run produced.
#[derive(Debug)]
pub struct LeaderOutcome {
    /// The synthesized final text, the round's submission.
    pub submission_content: String,
    /// One entry per tool invocation, in invocation order.
    pub member_submissions: Vec<MemberSubmission>,
    /// Opaque serialized conversation, sufficient to resume.
    pub message_history: serde_json::Value,
    /// Leader usage plus every invoked member's usage.
    pub usage: TokenUsage,
}

struct MemberBinding {
    agent_name: String,
    agent_type: String,
    tool: ToolSpec,
    agent: Box<dyn MemberAgent>,
}

pub struct LeaderAgent {
    client: Arc<dyn Provider>,
    model: String,
    params: SamplingParams,
    system_instruction: Option<String>,
    members: Vec<MemberBinding>,
}

impl LeaderAgent {
    /// Build a leader and all its member agents from the team config.
    /// Credential problems surface here, before any round runs.
    pub fn from_team(team: &TeamConfig, factory: &ProviderFactory) -> EngineResult<Self> {
        let (client, model) = factory.client_for(&team.leader.model)?;

        let mut members = Vec::with_capacity(team.members.len());
        for spec in &team.members {
            members.push(MemberBinding {
                agent_name: spec.agent_name.clone(),
                agent_type: spec.agent_type.clone(),
                tool: ToolSpec {
                    name: spec.tool_name.clone(),
                    description: spec.tool_description.clone(),
                    parameters: serde_json::json!({
                        "type": "object",
                        "additionalProperties": false,
                        "properties": {
                            "task": {
                                "type": "string",
                                "minLength": 1,
                                "description": "The delegated subtask for this member"
                            }
                        },
                        "required": ["task"]
                    }),
                },
                agent: create_member_agent(spec, factory)?,
            });
        }

        Ok(Self {
            client,
            model,
            params: SamplingParams {
                temperature: team.leader.temperature,
                max_tokens: team.leader.max_tokens,
                seed: None,
            },
            system_instruction: team.leader.system_instruction.clone(),
            members,
        })
    }

    /// Run one round's conversation to a final synthesized submission.
    pub async fn run(&self, prompt: &str) -> EngineResult<LeaderOutcome> {
        let mut history: Vec<ChatMessage> = Vec::new();
        if let Some(system) = &self.system_instruction {
            history.push(ChatMessage::system(system.clone()));
        }
        history.push(ChatMessage::user(prompt));

        let tools: Vec<ToolSpec> = self.members.iter().map(|m| m.tool.clone()).collect();
        let mut submissions: Vec<MemberSubmission> = Vec::new();
        let mut usage = TokenUsage::default();

        for _iteration in 0..MAX_TOOL_ITERATIONS {
            let response = self
                .client
                .chat(
                    ChatRequest::with_tools(&history, &tools),
                    &self.model,
                    self.params,
                )
                .await?;
            usage.add(&response.usage);

            let text = response.text.clone().unwrap_or_default();

            if response.tool_calls.is_empty() {
                if text.trim().is_empty() {
                    return Err(EngineError::ProviderPermanent(
                        "leader produced an empty submission".into(),
                    ));
                }
                history.push(ChatMessage::assistant(text.clone()));
                return Ok(LeaderOutcome {
                    submission_content: text,
                    member_submissions: submissions,
                    message_history: encode_history(&history),
                    usage,
                });
            }

            history.push(ChatMessage::assistant_with_tool_calls(
                text,
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let (submission, reply) = self.dispatch(call, &mut usage).await;
                tracing::debug!(
                    tool = %call.name,
                    agent = %submission.agent_name,
                    status = ?submission.status,
                    "member tool call finished"
                );
                submissions.push(submission);
                history.push(ChatMessage::tool(call.id.clone(), reply));
            }
        }

        Err(EngineError::ProviderPermanent(format!(
            "leader exceeded {MAX_TOOL_ITERATIONS} tool iterations without a final submission"
        )))
    }

    /// Execute one member tool call. Always yields a submission; failures are
    /// recorded and the error text is fed back to the leader.
    async fn dispatch(&self, call: &ToolCall, usage: &mut TokenUsage) -> (MemberSubmission, String) {
        let Some(binding) = self.members.iter().find(|m| m.tool.name == call.name) else {
            let error = EngineError::ProviderPermanent(format!(
                "leader invoked unknown tool '{}'",
                call.name
            ));
            let submission = MemberSubmission::failure(&call.name, "unknown", &error);
            let reply = format!(
                "Error: no member is bound to tool '{}'. Available tools: {}",
                call.name,
                self.members
                    .iter()
                    .map(|m| m.tool.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            return (submission, reply);
        };

        let task = match parse_task_argument(&call.arguments) {
            Ok(task) => task,
            Err(error) => {
                let submission =
                    MemberSubmission::failure(&binding.agent_name, &binding.agent_type, &error);
                return (submission, format!("Error: {error}"));
            }
        };

        match binding.agent.run(&task).await {
            Ok(output) => {
                usage.add(&output.usage);
                let submission = MemberSubmission::success(
                    &binding.agent_name,
                    &binding.agent_type,
                    output.content.clone(),
                    output.usage,
                );
                (submission, output.content)
            }
            Err(error) => {
                let submission =
                    MemberSubmission::failure(&binding.agent_name, &binding.agent_type, &error);
                let reply = format!("Error: member '{}' failed: {error}", binding.agent_name);
                (submission, reply)
            }
        }
    }
}

fn parse_task_argument(arguments: &str) -> EngineResult<String> {
    let value: serde_json::Value = serde_json::from_str(arguments).map_err(|e| {
        EngineError::ProviderPermanent(format!("malformed tool arguments '{arguments}': {e}"))
    })?;
    match value.get("task").and_then(|t| t.as_str()) {
        Some(task) if !task.trim().is_empty() => Ok(task.to_string()),
        _ => Err(EngineError::ProviderPermanent(
            "tool call is missing a non-empty 'task' argument".into(),
        )),
    }
}

fn encode_history(history: &[ChatMessage]) -> serde_json::Value {
    serde_json::json!({
        "version": MESSAGE_HISTORY_VERSION,
        "messages": history,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentParams, MemberSpec};
    use crate::engine::types::SubmissionStatus;
    use crate::providers::ChatResponse;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Provider returning scripted responses in FIFO order.
    struct ScriptedProvider {
        responses: Mutex<Vec<ChatResponse>>,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<ChatResponse>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn chat(
            &self,
            _request: ChatRequest<'_>,
            _model: &str,
            _params: SamplingParams,
        ) -> EngineResult<ChatResponse> {
            let mut guard = self.responses.lock();
            if guard.is_empty() {
                return Ok(ChatResponse {
                    text: Some("done".into()),
                    tool_calls: vec![],
                    usage: TokenUsage::single_request(1, 1),
                });
            }
            Ok(guard.remove(0))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    /// Member provider that echoes the task back.
    struct EchoProvider;

    #[async_trait]
    impl Provider for EchoProvider {
        async fn chat(
            &self,
            request: ChatRequest<'_>,
            _model: &str,
            _params: SamplingParams,
        ) -> EngineResult<ChatResponse> {
            let task = request.messages.last().unwrap().content.clone();
            Ok(ChatResponse {
                text: Some(format!("echo: {task}")),
                tool_calls: vec![],
                usage: TokenUsage::single_request(2, 3),
            })
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    /// Member provider that always fails permanently.
    struct BrokenProvider;

    #[async_trait]
    impl Provider for BrokenProvider {
        async fn chat(
            &self,
            _request: ChatRequest<'_>,
            _model: &str,
            _params: SamplingParams,
        ) -> EngineResult<ChatResponse> {
            Err(EngineError::ProviderPermanent("capability unsupported".into()))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn member(name: &str, provider: &str) -> MemberSpec {
        MemberSpec {
            agent_name: name.to_string(),
            agent_type: "plain".into(),
            tool_name: format!("delegate_to_{name}"),
            tool_description: format!("{name} does focused work"),
            params: AgentParams {
                model: format!("{provider}:member-model"),
                temperature: 0.5,
                max_tokens: 1024,
                system_instruction: None,
            },
            plugin_command: None,
        }
    }

    fn team(members: Vec<MemberSpec>) -> TeamConfig {
        TeamConfig {
            team_id: "alpha".into(),
            team_name: "Alpha".into(),
            max_concurrent_members: 4,
            leader: AgentParams {
                model: "scripted:leader-model".into(),
                temperature: 0.7,
                max_tokens: 4096,
                system_instruction: Some("You lead the team.".into()),
            },
            members,
        }
    }

    fn tool_call(id: &str, name: &str, task: &str) -> ToolCall {
        ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({ "task": task }).to_string(),
        }
    }

    fn factory(leader_responses: Vec<ChatResponse>) -> ProviderFactory {
        let factory = ProviderFactory::new(0);
        factory.register("scripted", Arc::new(ScriptedProvider::new(leader_responses)));
        factory.register("echo", Arc::new(EchoProvider));
        factory.register("broken", Arc::new(BrokenProvider));
        factory
    }

    #[tokio::test]
    async fn leader_without_tool_calls_synthesizes_directly() {
        let factory = factory(vec![ChatResponse {
            text: Some("direct answer".into()),
            tool_calls: vec![],
            usage: TokenUsage::single_request(5, 7),
        }]);
        let leader = LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        assert_eq!(outcome.submission_content, "direct answer");
        assert!(outcome.member_submissions.is_empty());
        assert_eq!(outcome.usage, TokenUsage::single_request(5, 7));
        assert_eq!(outcome.message_history["version"], 1);
    }

    #[tokio::test]
    async fn k_tool_calls_yield_k_submissions_in_order() {
        let factory = factory(vec![
            ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![
                    tool_call("c1", "delegate_to_analyst", "first"),
                    tool_call("c2", "delegate_to_writer", "second"),
                ],
                usage: TokenUsage::single_request(10, 2),
            },
            ChatResponse {
                text: Some("synthesis of both".into()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(20, 4),
            },
        ]);
        let leader = LeaderAgent::from_team(
            &team(vec![member("analyst", "echo"), member("writer", "echo")]),
            &factory,
        )
        .unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        assert_eq!(outcome.submission_content, "synthesis of both");
        assert_eq!(outcome.member_submissions.len(), 2);
        assert_eq!(outcome.member_submissions[0].agent_name, "analyst");
        assert_eq!(outcome.member_submissions[0].content, "echo: first");
        assert_eq!(outcome.member_submissions[1].agent_name, "writer");
        assert_eq!(outcome.member_submissions[1].content, "echo: second");
        // Leader usage (30, 6, 2 requests) plus two member calls (2, 3, 1) each.
        assert_eq!(outcome.usage.input_tokens, 34);
        assert_eq!(outcome.usage.output_tokens, 12);
        assert_eq!(outcome.usage.requests, 4);
    }

    #[tokio::test]
    async fn member_failure_is_recorded_not_fatal() {
        let factory = factory(vec![
            ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![
                    tool_call("c1", "delegate_to_good", "works"),
                    tool_call("c2", "delegate_to_bad", "explodes"),
                ],
                usage: TokenUsage::single_request(1, 1),
            },
            ChatResponse {
                text: Some("compensated answer".into()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(1, 1),
            },
        ]);
        let leader = LeaderAgent::from_team(
            &team(vec![member("good", "echo"), member("bad", "broken")]),
            &factory,
        )
        .unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        assert_eq!(outcome.submission_content, "compensated answer");
        assert_eq!(outcome.member_submissions.len(), 2);
        assert_eq!(
            outcome.member_submissions[0].status,
            SubmissionStatus::Success
        );
        assert_eq!(
            outcome.member_submissions[1].status,
            SubmissionStatus::Failure
        );
        assert_eq!(
            outcome.member_submissions[1].error_kind.as_deref(),
            Some("provider_permanent")
        );
    }

    #[tokio::test]
    async fn unknown_tool_records_failure_and_continues() {
        let factory = factory(vec![
            ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![tool_call("c1", "delegate_to_phantom", "boo")],
                usage: TokenUsage::single_request(1, 1),
            },
            ChatResponse {
                text: Some("recovered".into()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(1, 1),
            },
        ]);
        let leader =
            LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        assert_eq!(outcome.submission_content, "recovered");
        assert_eq!(outcome.member_submissions.len(), 1);
        assert_eq!(
            outcome.member_submissions[0].status,
            SubmissionStatus::Failure
        );
    }

    #[tokio::test]
    async fn malformed_arguments_record_failure() {
        let factory = factory(vec![
            ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![ToolCall {
                    id: "c1".into(),
                    name: "delegate_to_analyst".into(),
                    arguments: "{not json".into(),
                }],
                usage: TokenUsage::single_request(1, 1),
            },
            ChatResponse {
                text: Some("moved on".into()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(1, 1),
            },
        ]);
        let leader =
            LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        assert_eq!(outcome.member_submissions.len(), 1);
        assert_eq!(
            outcome.member_submissions[0].status,
            SubmissionStatus::Failure
        );
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_iteration_ceiling() {
        let responses = (0..20)
            .map(|i| ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![tool_call(
                    &format!("c{i}"),
                    "delegate_to_analyst",
                    "again",
                )],
                usage: TokenUsage::single_request(1, 1),
            })
            .collect();
        let factory = factory(responses);
        let leader =
            LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let err = leader.run("solve it").await.unwrap_err();
        assert!(err.to_string().contains("tool iterations"));
    }

    #[tokio::test]
    async fn empty_final_text_is_an_error() {
        let factory = factory(vec![ChatResponse {
            text: Some("  ".into()),
            tool_calls: vec![],
            usage: TokenUsage::single_request(1, 1),
        }]);
        let leader =
            LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let err = leader.run("solve it").await.unwrap_err();
        assert!(err.to_string().contains("empty submission"));
    }

    #[tokio::test]
    async fn message_history_is_versioned_and_complete() {
        let factory = factory(vec![
            ChatResponse {
                text: Some(String::new()),
                tool_calls: vec![tool_call("c1", "delegate_to_analyst", "dig")],
                usage: TokenUsage::single_request(1, 1),
            },
            ChatResponse {
                text: Some("final".into()),
                tool_calls: vec![],
                usage: TokenUsage::single_request(1, 1),
            },
        ]);
        let leader =
            LeaderAgent::from_team(&team(vec![member("analyst", "echo")]), &factory).unwrap();

        let outcome = leader.run("solve it").await.unwrap();
        let messages = outcome.message_history["messages"].as_array().unwrap();
        // system + user + assistant(tool_calls) + tool + assistant(final)
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[4]["content"], "final");
    }

    #[test]
    fn task_argument_parsing() {
        assert_eq!(
            parse_task_argument(r#"{"task": "do it"}"#).unwrap(),
            "do it"
        );
        assert!(parse_task_argument(r#"{"task": ""}"#).is_err());
        assert!(parse_task_argument(r#"{"other": "x"}"#).is_err());
        assert!(parse_task_argument("garbage").is_err());
    }
}

pub mod schema;
pub mod workspace;

pub use schema::{
    AgentParams, CliOverrides, EvaluatorConfig, JudgmentConfig, MemberSpec, MetricConfig,
    OrchestratorSettings, PromptBuilderConfig, Provenance, TeamConfig, AGENT_TYPES,
};
pub use workspace::Workspace;

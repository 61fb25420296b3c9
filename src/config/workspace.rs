//! Workspace directory layout.
//!
//! Everything the engine persists lives under one explicit root:
//! `configs/` (TOMLs), `logs/` (diagnostics), `templates/` (scaffolding),
//! and `mixseek.db` (the aggregation store). No other files are load-bearing.

use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root.join("templates")
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("mixseek.db")
    }

    /// Create the directory layout and drop sample configuration files for
    /// `mixseek init`. Existing files are left untouched.
    pub fn scaffold(&self) -> EngineResult<()> {
        for dir in [self.configs_dir(), self.logs_dir(), self.templates_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                EngineError::Configuration(format!("cannot create {}: {e}", dir.display()))
            })?;
        }

        let samples = [
            ("orchestrator.toml", SAMPLE_ORCHESTRATOR),
            ("team-alpha.toml", SAMPLE_TEAM),
            ("evaluator.toml", SAMPLE_EVALUATOR),
            ("judgment.toml", SAMPLE_JUDGMENT),
            ("prompt_builder.toml", SAMPLE_PROMPT_BUILDER),
        ];
        for (name, contents) in samples {
            let path = self.configs_dir().join(name);
            if !path.exists() {
                std::fs::write(&path, contents).map_err(|e| {
                    EngineError::Configuration(format!("cannot write {}: {e}", path.display()))
                })?;
            }
        }
        Ok(())
    }
}

const SAMPLE_ORCHESTRATOR: &str = r#"# MixSeek orchestrator configuration.
timeout_per_team_seconds = 600
max_rounds = 3
min_rounds = 1
submission_timeout_seconds = 180
judgment_timeout_seconds = 120

teams = [{ config = "team-alpha.toml" }]

evaluator_config = "evaluator.toml"
judgment_config = "judgment.toml"
prompt_builder_config = "prompt_builder.toml"
"#;

const SAMPLE_TEAM: &str = r#"[team]
team_id = "alpha"
team_name = "Alpha"
max_concurrent_members = 4

[team.leader]
model = "anthropic:claude-sonnet-4-20250514"
temperature = 0.7
max_tokens = 4096

[[team.members]]
agent_name = "analyst"
agent_type = "plain"
tool_description = "Analyzes the task and drafts a structured answer."
model = "anthropic:claude-sonnet-4-20250514"
temperature = 0.5

[[team.members]]
agent_name = "researcher"
agent_type = "web_search"
tool_description = "Searches the web for current facts and sources."
model = "google:gemini-2.0-flash"
"#;

const SAMPLE_EVALUATOR: &str = r#"default_model = "openai:gpt-4o"
temperature = 0.0
max_tokens = 2048
max_retries = 3
timeout_seconds = 120

[[metrics]]
name = "ClarityCoherence"
weight = 0.3

[[metrics]]
name = "Coverage"
weight = 0.3

[[metrics]]
name = "Relevance"
weight = 0.4
"#;

const SAMPLE_JUDGMENT: &str = r#"model = "openai:gpt-4o"
temperature = 0.0
timeout_seconds = 120
"#;

const SAMPLE_PROMPT_BUILDER: &str = r#"# Placeholders: {{ user_prompt }}, {{ round_number }}, {{ submission_history }},
# {{ ranking_table }}, {{ team_position_message }}, {{ current_datetime }}.
# Delete this file to fall back to the built-in template.

template = """
# Task
{{ user_prompt }}

# Round {{ round_number }} — {{ current_datetime }}

## Your previous rounds
{{ submission_history }}

## Current leaderboard
{{ ranking_table }}

{{ team_position_message }}

{{ improvement_directive }}
"""

improvement_directive = "Improve on your previous submission: address the evaluation feedback, keep what scored well, and produce a complete, self-contained answer."
"#;

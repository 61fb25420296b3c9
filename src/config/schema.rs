//! Typed configuration records for the engine.
//!
//! Resolution follows CLI > env > TOML > default, with per-field provenance
//! recorded for `config show`. Required fields are errors when missing; there
//! are no implicit fallbacks, and configuration is never reloaded at runtime.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, EngineResult};

/// Where a resolved field value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Default,
    Toml,
    Env,
    Cli,
}

/// Supported member agent capabilities.
pub const AGENT_TYPES: [&str; 4] = ["plain", "web_search", "code_exec", "custom"];

// ── Agent parameters ─────────────────────────────────────────────

/// Sampling configuration shared by leaders, members, evaluator metrics and
/// the judge. Model ids are always explicit `provider:model` strings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentParams {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

// ── Team configuration ───────────────────────────────────────────

/// One member slot in a team. `tool_name` and `tool_description` are what the
/// leader model sees when deciding whom to invoke.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemberSpec {
    pub agent_name: String,
    pub agent_type: String,
    #[serde(default)]
    pub tool_name: String,
    pub tool_description: String,
    #[serde(flatten)]
    pub params: AgentParams,
    /// Command line for `agent_type = "custom"` out-of-process members.
    #[serde(default)]
    pub plugin_command: Option<String>,
}

/// A member entry in a team file: inline spec, or a reference to another
/// TOML file resolved eagerly at load time.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MemberEntry {
    Reference { config: String },
    Inline(MemberSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamConfig {
    pub team_id: String,
    pub team_name: String,
    #[serde(default = "default_max_concurrent_members")]
    pub max_concurrent_members: u32,
    pub leader: AgentParams,
    pub members: Vec<MemberSpec>,
}

fn default_max_concurrent_members() -> u32 {
    4
}

#[derive(Debug, Deserialize)]
struct TeamFile {
    team: TeamFileBody,
}

#[derive(Debug, Deserialize)]
struct TeamFileBody {
    team_id: String,
    team_name: String,
    #[serde(default = "default_max_concurrent_members")]
    max_concurrent_members: u32,
    leader: AgentParams,
    #[serde(default)]
    members: Vec<MemberEntry>,
}

impl TeamConfig {
    /// Load a team file, resolving `{ config = "…" }` member references
    /// relative to the file's directory. Cycles are configuration errors.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!("cannot read team config {}: {e}", path.display()))
        })?;
        let file: TeamFile = toml::from_str(&contents).map_err(|e| {
            EngineError::Configuration(format!("invalid team config {}: {e}", path.display()))
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut members = Vec::with_capacity(file.team.members.len());
        for entry in file.team.members {
            members.push(resolve_member_entry(entry, base_dir, &mut HashSet::new())?);
        }

        let mut config = Self {
            team_id: file.team.team_id,
            team_name: file.team.team_name,
            max_concurrent_members: file.team.max_concurrent_members,
            leader: file.team.leader,
            members,
        };
        config.resolve_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill derived defaults (`tool_name = delegate_to_{agent_name}`).
    pub fn resolve_defaults(&mut self) {
        for member in &mut self.members {
            if member.tool_name.is_empty() {
                member.tool_name = format!("delegate_to_{}", member.agent_name);
            }
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.team_id.trim().is_empty() {
            return Err(EngineError::Configuration("team_id must not be empty".into()));
        }
        if self.team_name.trim().is_empty() {
            return Err(EngineError::Configuration(format!(
                "team '{}': team_name must not be empty",
                self.team_id
            )));
        }
        if self.max_concurrent_members == 0 {
            return Err(EngineError::Configuration(format!(
                "team '{}': max_concurrent_members must be positive",
                self.team_id
            )));
        }
        if self.members.is_empty() || self.members.len() > 50 {
            return Err(EngineError::Configuration(format!(
                "team '{}': members must have 1..=50 entries, got {}",
                self.team_id,
                self.members.len()
            )));
        }

        let mut seen_names = HashSet::new();
        for member in &self.members {
            if member.agent_name.trim().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "team '{}': member agent_name must not be empty",
                    self.team_id
                )));
            }
            if !seen_names.insert(member.agent_name.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "team '{}': duplicate member agent_name '{}'",
                    self.team_id, member.agent_name
                )));
            }
            if member.tool_description.trim().is_empty() {
                return Err(EngineError::Configuration(format!(
                    "team '{}': member '{}' needs a tool_description (the leader selects by it)",
                    self.team_id, member.agent_name
                )));
            }
            if !AGENT_TYPES.contains(&member.agent_type.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "team '{}': member '{}' has unknown agent_type '{}' (expected one of {:?})",
                    self.team_id, member.agent_name, member.agent_type, AGENT_TYPES
                )));
            }
            if member.agent_type == "custom" && member.plugin_command.is_none() {
                return Err(EngineError::Configuration(format!(
                    "team '{}': custom member '{}' requires plugin_command",
                    self.team_id, member.agent_name
                )));
            }
        }
        Ok(())
    }
}

fn resolve_member_entry(
    entry: MemberEntry,
    base_dir: &Path,
    visiting: &mut HashSet<PathBuf>,
) -> EngineResult<MemberSpec> {
    match entry {
        MemberEntry::Inline(spec) => Ok(spec),
        MemberEntry::Reference { config } => {
            let path = base_dir.join(&config);
            let canonical = path.canonicalize().map_err(|e| {
                EngineError::Configuration(format!(
                    "unresolvable member reference '{config}': {e}"
                ))
            })?;
            if !visiting.insert(canonical.clone()) {
                return Err(EngineError::Configuration(format!(
                    "member reference cycle through '{}'",
                    canonical.display()
                )));
            }
            let contents = std::fs::read_to_string(&canonical).map_err(|e| {
                EngineError::Configuration(format!(
                    "cannot read member config {}: {e}",
                    canonical.display()
                ))
            })?;
            let nested: MemberEntry = toml::from_str(&contents).map_err(|e| {
                EngineError::Configuration(format!(
                    "invalid member config {}: {e}",
                    canonical.display()
                ))
            })?;
            let next_base = canonical.parent().unwrap_or_else(|| Path::new("."));
            let resolved = resolve_member_entry(nested, next_base, visiting)?;
            visiting.remove(&canonical);
            Ok(resolved)
        }
    }
}

// ── Evaluator configuration ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricConfig {
    pub name: String,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluatorConfig {
    pub default_model: String,
    #[serde(default = "default_judge_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_phase_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_metrics")]
    pub metrics: Vec<MetricConfig>,
}

fn default_judge_temperature() -> f64 {
    0.0
}

fn default_max_retries() -> u32 {
    3
}

fn default_phase_timeout_seconds() -> u64 {
    120
}

/// Built-in metric set used when `evaluator.toml` declares none.
fn default_metrics() -> Vec<MetricConfig> {
    ["ClarityCoherence", "Coverage", "Relevance"]
        .into_iter()
        .map(|name| MetricConfig {
            name: name.to_string(),
            weight: None,
            model: None,
            temperature: None,
            max_tokens: None,
            system_instruction: None,
        })
        .collect()
}

impl EvaluatorConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot read evaluator config {}: {e}",
                path.display()
            ))
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            EngineError::Configuration(format!("invalid evaluator config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Weights must all be present summing to 1 ± 0.001, or all absent
    /// (assigned uniformly).
    pub fn validate(&self) -> EngineResult<()> {
        if self.metrics.is_empty() {
            return Err(EngineError::Configuration(
                "evaluator needs at least one metric".into(),
            ));
        }
        let with_weight = self.metrics.iter().filter(|m| m.weight.is_some()).count();
        if with_weight != 0 && with_weight != self.metrics.len() {
            return Err(EngineError::Configuration(
                "metric weights must be all present or all absent".into(),
            ));
        }
        if with_weight == self.metrics.len() {
            let sum: f64 = self.metrics.iter().filter_map(|m| m.weight).sum();
            if (sum - 1.0).abs() > 1e-3 {
                return Err(EngineError::Configuration(format!(
                    "metric weights must sum to 1 (±0.001), got {sum}"
                )));
            }
            if self.metrics.iter().any(|m| m.weight.unwrap_or(0.0) < 0.0) {
                return Err(EngineError::Configuration(
                    "metric weights must be non-negative".into(),
                ));
            }
        }
        Ok(())
    }

    /// Effective weight per metric after the uniform-assignment rule.
    pub fn effective_weights(&self) -> Vec<f64> {
        if self.metrics.iter().all(|m| m.weight.is_none()) {
            let uniform = 1.0 / self.metrics.len() as f64;
            vec![uniform; self.metrics.len()]
        } else {
            self.metrics.iter().map(|m| m.weight.unwrap_or(0.0)).collect()
        }
    }
}

// ── Judgment configuration ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgmentConfig {
    pub model: String,
    #[serde(default = "default_judge_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_phase_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

impl JudgmentConfig {
    pub fn load(path: &Path) -> EngineResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot read judgment config {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|e| {
            EngineError::Configuration(format!("invalid judgment config {}: {e}", path.display()))
        })
    }
}

// ── Prompt builder configuration ─────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptBuilderConfig {
    #[serde(default = "default_prompt_template")]
    pub template: String,
    #[serde(default = "default_improvement_directive")]
    pub improvement_directive: String,
}

impl Default for PromptBuilderConfig {
    fn default() -> Self {
        Self {
            template: default_prompt_template(),
            improvement_directive: default_improvement_directive(),
        }
    }
}

pub(crate) fn default_prompt_template() -> String {
    "\
# Task
{{ user_prompt }}

# Round {{ round_number }} — {{ current_datetime }}

## Your previous rounds
{{ submission_history }}

## Current leaderboard
{{ ranking_table }}

{{ team_position_message }}

{{ improvement_directive }}
"
    .to_string()
}

fn default_improvement_directive() -> String {
    "Improve on your previous submission: address the evaluation feedback, \
     keep what scored well, and produce a complete, self-contained answer."
        .to_string()
}

impl PromptBuilderConfig {
    /// Missing file uses the built-in default template.
    pub fn load_or_default(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot read prompt builder config {}: {e}",
                path.display()
            ))
        })?;
        toml::from_str(&contents).map_err(|e| {
            EngineError::Configuration(format!(
                "invalid prompt builder config {}: {e}",
                path.display()
            ))
        })
    }
}

// ── Orchestrator settings ────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct TeamRef {
    config: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OrchestratorFile {
    #[serde(default)]
    workspace_path: Option<String>,
    #[serde(default = "default_timeout_per_team")]
    timeout_per_team_seconds: u64,
    #[serde(default = "default_max_rounds")]
    max_rounds: u32,
    #[serde(default = "default_min_rounds")]
    min_rounds: u32,
    #[serde(default = "default_submission_timeout")]
    submission_timeout_seconds: u64,
    #[serde(default = "default_judgment_timeout")]
    judgment_timeout_seconds: u64,
    teams: Vec<TeamRef>,
    #[serde(default = "default_evaluator_config")]
    evaluator_config: String,
    #[serde(default = "default_judgment_config")]
    judgment_config: String,
    #[serde(default = "default_prompt_builder_config")]
    prompt_builder_config: String,
}

fn default_timeout_per_team() -> u64 {
    600
}

fn default_max_rounds() -> u32 {
    3
}

fn default_min_rounds() -> u32 {
    1
}

fn default_submission_timeout() -> u64 {
    180
}

fn default_judgment_timeout() -> u64 {
    120
}

fn default_evaluator_config() -> String {
    "evaluator.toml".into()
}

fn default_judgment_config() -> String {
    "judgment.toml".into()
}

fn default_prompt_builder_config() -> String {
    "prompt_builder.toml".into()
}

/// Fully resolved, validated settings handed to the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub workspace_path: PathBuf,
    pub timeout_per_team_seconds: u64,
    pub max_rounds: u32,
    pub min_rounds: u32,
    pub submission_timeout_seconds: u64,
    pub judgment_timeout_seconds: u64,
    pub teams: Vec<TeamConfig>,
    pub evaluator: EvaluatorConfig,
    pub judgment: JudgmentConfig,
    pub prompt_builder: PromptBuilderConfig,
    /// Per-field provenance for `config show`.
    pub provenance: BTreeMap<&'static str, Provenance>,
}

/// Scalar overrides collected from the CLI. CLI beats env beats TOML.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub workspace: Option<PathBuf>,
    pub max_rounds: Option<u32>,
    pub min_rounds: Option<u32>,
}

impl OrchestratorSettings {
    /// Resolve the workspace root: CLI > `MIXSEEK_WORKSPACE`. There is no
    /// implicit fallback to the current working directory.
    pub fn resolve_workspace(cli_workspace: Option<&Path>) -> EngineResult<PathBuf> {
        if let Some(path) = cli_workspace {
            return Ok(path.to_path_buf());
        }
        match std::env::var("MIXSEEK_WORKSPACE") {
            Ok(value) if !value.is_empty() => Ok(PathBuf::from(value)),
            _ => Err(EngineError::Configuration(
                "workspace is not set; pass --workspace or set MIXSEEK_WORKSPACE".into(),
            )),
        }
    }

    /// Load `configs/orchestrator.toml` under the workspace, resolve team and
    /// collaborator config references, then layer env and CLI overrides.
    pub fn load(overrides: &CliOverrides) -> EngineResult<Self> {
        let workspace = Self::resolve_workspace(overrides.workspace.as_deref())?;
        let configs_dir = workspace.join("configs");
        let orchestrator_path = configs_dir.join("orchestrator.toml");

        let contents = std::fs::read_to_string(&orchestrator_path).map_err(|e| {
            EngineError::Configuration(format!(
                "cannot read {}: {e}",
                orchestrator_path.display()
            ))
        })?;
        let file: OrchestratorFile = toml::from_str(&contents).map_err(|e| {
            EngineError::Configuration(format!(
                "invalid orchestrator config {}: {e}",
                orchestrator_path.display()
            ))
        })?;

        let mut provenance: BTreeMap<&'static str, Provenance> = BTreeMap::new();
        provenance.insert(
            "workspace_path",
            if overrides.workspace.is_some() {
                Provenance::Cli
            } else {
                Provenance::Env
            },
        );
        for key in [
            "timeout_per_team_seconds",
            "max_rounds",
            "min_rounds",
            "submission_timeout_seconds",
            "judgment_timeout_seconds",
        ] {
            provenance.insert(key, Provenance::Toml);
        }

        if file.workspace_path.is_some() {
            tracing::debug!(
                "workspace_path in orchestrator.toml is informational; the CLI/env value wins"
            );
        }

        let mut teams = Vec::with_capacity(file.teams.len());
        for team_ref in &file.teams {
            teams.push(TeamConfig::load(&configs_dir.join(&team_ref.config))?);
        }

        let evaluator = EvaluatorConfig::load(&configs_dir.join(&file.evaluator_config))?;
        let judgment = JudgmentConfig::load(&configs_dir.join(&file.judgment_config))?;
        let prompt_builder =
            PromptBuilderConfig::load_or_default(&configs_dir.join(&file.prompt_builder_config))?;

        let mut settings = Self {
            workspace_path: workspace,
            timeout_per_team_seconds: file.timeout_per_team_seconds,
            max_rounds: file.max_rounds,
            min_rounds: file.min_rounds,
            submission_timeout_seconds: file.submission_timeout_seconds,
            judgment_timeout_seconds: file.judgment_timeout_seconds,
            teams,
            evaluator,
            judgment,
            prompt_builder,
            provenance,
        };

        settings.apply_env_overrides();
        settings.apply_cli_overrides(overrides);
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `MIXSEEK_*` environment overrides. Nested fields use a double
    /// underscore (`MIXSEEK_ORCHESTRATOR__MAX_ROUNDS`); the flat spelling
    /// (`MIXSEEK_MAX_ROUNDS`) is accepted for orchestrator scalars.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_u32("ORCHESTRATOR", "MAX_ROUNDS") {
            self.max_rounds = value;
            self.provenance.insert("max_rounds", Provenance::Env);
        }
        if let Some(value) = env_u32("ORCHESTRATOR", "MIN_ROUNDS") {
            self.min_rounds = value;
            self.provenance.insert("min_rounds", Provenance::Env);
        }
        if let Some(value) = env_u64("ORCHESTRATOR", "TIMEOUT_PER_TEAM_SECONDS") {
            self.timeout_per_team_seconds = value;
            self.provenance
                .insert("timeout_per_team_seconds", Provenance::Env);
        }
        if let Some(value) = env_u64("ORCHESTRATOR", "SUBMISSION_TIMEOUT_SECONDS") {
            self.submission_timeout_seconds = value;
            self.provenance
                .insert("submission_timeout_seconds", Provenance::Env);
        }
        if let Some(value) = env_u64("ORCHESTRATOR", "JUDGMENT_TIMEOUT_SECONDS") {
            self.judgment_timeout_seconds = value;
            self.provenance
                .insert("judgment_timeout_seconds", Provenance::Env);
        }
    }

    fn apply_cli_overrides(&mut self, overrides: &CliOverrides) {
        if let Some(max_rounds) = overrides.max_rounds {
            self.max_rounds = max_rounds;
            self.provenance.insert("max_rounds", Provenance::Cli);
        }
        if let Some(min_rounds) = overrides.min_rounds {
            self.min_rounds = min_rounds;
            self.provenance.insert("min_rounds", Provenance::Cli);
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if !(1..=10).contains(&self.max_rounds) {
            return Err(EngineError::Configuration(format!(
                "max_rounds must be in 1..=10, got {}",
                self.max_rounds
            )));
        }
        if self.min_rounds < 1 || self.min_rounds > self.max_rounds {
            return Err(EngineError::Configuration(format!(
                "min_rounds must be in 1..=max_rounds ({}), got {}",
                self.max_rounds, self.min_rounds
            )));
        }
        if self.timeout_per_team_seconds == 0
            || self.submission_timeout_seconds == 0
            || self.judgment_timeout_seconds == 0
        {
            return Err(EngineError::Configuration(
                "timeouts must be positive".into(),
            ));
        }
        if self.teams.is_empty() {
            return Err(EngineError::Configuration(
                "orchestrator.toml must reference at least one team".into(),
            ));
        }
        let mut ids = HashSet::new();
        for team in &self.teams {
            team.validate()?;
            if !ids.insert(team.team_id.as_str()) {
                return Err(EngineError::Configuration(format!(
                    "duplicate team_id '{}'",
                    team.team_id
                )));
            }
        }
        self.evaluator.validate()?;
        Ok(())
    }
}

fn env_lookup(section: &str, field: &str) -> Option<String> {
    std::env::var(format!("MIXSEEK_{section}__{field}"))
        .or_else(|_| std::env::var(format!("MIXSEEK_{field}")))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_u32(section: &str, field: &str) -> Option<u32> {
    env_lookup(section, field).and_then(|v| v.parse().ok())
}

fn env_u64(section: &str, field: &str) -> Option<u64> {
    env_lookup(section, field).and_then(|v| v.parse().ok())
}

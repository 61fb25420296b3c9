//! Core data model for the execution kernel.
//!
//! In-memory objects are snapshots; the aggregation store is the sole owner
//! of durable records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::TeamConfig;
use crate::error::{EngineError, EngineResult};
use crate::providers::TokenUsage;

/// Immutable description of one orchestrator execution.
#[derive(Debug, Clone)]
pub struct ExecutionTask {
    pub execution_id: String,
    pub user_prompt: String,
    pub teams: Vec<TeamConfig>,
    pub per_team_deadline: Duration,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub submission_timeout: Duration,
    pub judgment_timeout: Duration,
}

impl ExecutionTask {
    /// Validate construction invariants. The orchestrator re-validates the
    /// same bounds from its settings record (defense-in-depth).
    pub fn validate(&self) -> EngineResult<()> {
        if self.user_prompt.trim().is_empty() {
            return Err(EngineError::Configuration(
                "user prompt must not be empty".into(),
            ));
        }
        if self.teams.is_empty() {
            return Err(EngineError::Configuration(
                "at least one team is required".into(),
            ));
        }
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
        if self.per_team_deadline.is_zero()
            || self.submission_timeout.is_zero()
            || self.judgment_timeout.is_zero()
        {
            return Err(EngineError::Configuration(
                "deadlines and timeouts must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Outcome of a single member-agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Success,
    Failure,
}

/// One member agent's individual contribution inside a round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberSubmission {
    pub agent_name: String,
    pub agent_type: String,
    pub content: String,
    pub status: SubmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub usage: TokenUsage,
    pub timestamp: DateTime<Utc>,
}

impl MemberSubmission {
    pub fn success(
        agent_name: &str,
        agent_type: &str,
        content: String,
        usage: TokenUsage,
    ) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            agent_type: agent_type.to_string(),
            content,
            status: SubmissionStatus::Success,
            error_kind: None,
            error_message: None,
            usage,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(agent_name: &str, agent_type: &str, error: &EngineError) -> Self {
        Self {
            agent_name: agent_name.to_string(),
            agent_type: agent_type.to_string(),
            content: String::new(),
            status: SubmissionStatus::Failure,
            error_kind: Some(error.kind().to_string()),
            error_message: Some(error.to_string()),
            usage: TokenUsage::default(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-metric evaluation row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricFeedback {
    pub name: String,
    pub score: f64,
    pub comment: String,
}

/// Output of one round for one team.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundState {
    pub execution_id: String,
    pub team_id: String,
    pub team_name: String,
    pub round_number: u32,
    pub submission_content: String,
    pub member_submissions: Vec<MemberSubmission>,
    /// Opaque serialized agent conversation, sufficient to resume.
    pub message_history: serde_json::Value,
    pub evaluation_score: f64,
    pub evaluation_feedback: Vec<MetricFeedback>,
    pub usage: TokenUsage,
    pub execution_time: Duration,
    pub completed_at: DateTime<Utc>,
}

/// Continuation judge verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub should_continue: bool,
    pub reasoning: String,
    pub confidence: f64,
}

/// Leaderboard projection for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub execution_id: String,
    pub team_id: String,
    pub team_name: String,
    pub round_number: u32,
    pub score: f64,
    pub submission_excerpt: String,
}

/// Lifecycle state of a team inside one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamState {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl TeamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Timeout)
    }
}

/// In-memory per-team status, orchestrator scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStatus {
    pub team_id: String,
    pub team_name: String,
    pub status: TeamState,
    /// 0 until the first round completes.
    pub current_round: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TeamStatus {
    pub fn pending(team_id: &str, team_name: &str) -> Self {
        Self {
            team_id: team_id.to_string(),
            team_name: team_name.to_string(),
            status: TeamState::Pending,
            current_round: 0,
            started_at: None,
            completed_at: None,
            error_kind: None,
            error_message: None,
        }
    }
}

/// Best persisted round for a team, as reported in the summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamResult {
    pub team_id: String,
    pub team_name: String,
    pub round_number: u32,
    pub score: f64,
    pub submission_content: String,
    pub usage: TokenUsage,
}

/// Final artifact of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub user_prompt: String,
    pub team_results: Vec<TeamResult>,
    pub team_statuses: Vec<TeamStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_team_id: Option<String>,
    pub total_teams: usize,
    pub completed_teams: usize,
    pub failed_teams: usize,
    pub total_execution_time: Duration,
}

/// Tie-break ordering shared by summary assembly and leaderboard ranking:
/// higher score wins; at equal score the earlier round, then the
/// lexicographically lower team id.
pub fn better_round(
    score_a: f64,
    round_a: u32,
    team_a: &str,
    score_b: f64,
    round_b: u32,
    team_b: &str,
) -> bool {
    if score_a != score_b {
        return score_a > score_b;
    }
    if round_a != round_b {
        return round_a < round_b;
    }
    team_a < team_b
}

//! Orchestrator: fans teams out in parallel and assembles the summary.
//!
//! One worker task per team; no cap on team parallelism beyond OS and
//! provider limits. The per-team deadline bounds a team's entire multi-round
//! execution: on expiry the team is marked `timeout`, in-flight work is
//! cancelled cooperatively, and nothing is retried. One team's failure never
//! aborts the others.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorSettings;
use crate::engine::evaluator::Evaluator;
use crate::engine::judge::ContinuationJudge;
use crate::engine::round::RoundController;
use crate::engine::types::{
    better_round, ExecutionSummary, ExecutionTask, RoundState, TeamResult, TeamState, TeamStatus,
};
use crate::error::EngineResult;
use crate::prompt::PromptBuilder;
use crate::providers::ProviderFactory;
use crate::store::AggregationStore;

pub struct Orchestrator {
    settings: OrchestratorSettings,
    factory: Arc<ProviderFactory>,
    db_path: PathBuf,
}

struct TeamOutcome {
    status: TeamStatus,
    rounds: Vec<RoundState>,
}

impl Orchestrator {
    pub fn new(settings: OrchestratorSettings) -> Self {
        let factory = Arc::new(ProviderFactory::new(settings.evaluator.max_retries));
        let db_path = crate::config::Workspace::new(&settings.workspace_path).db_path();
        Self {
            settings,
            factory,
            db_path,
        }
    }

    /// Test seam: inject a factory with pre-registered providers and an
    /// explicit database path.
    pub fn with_factory(
        settings: OrchestratorSettings,
        factory: Arc<ProviderFactory>,
        db_path: PathBuf,
    ) -> Self {
        Self {
            settings,
            factory,
            db_path,
        }
    }

    /// Run one execution over `user_prompt` and return the final summary.
    pub async fn execute(&self, user_prompt: &str) -> EngineResult<ExecutionSummary> {
        let started = Instant::now();

        let task = ExecutionTask {
            execution_id: Uuid::new_v4().to_string(),
            user_prompt: user_prompt.to_string(),
            teams: self.settings.teams.clone(),
            per_team_deadline: Duration::from_secs(self.settings.timeout_per_team_seconds),
            min_rounds: self.settings.min_rounds,
            max_rounds: self.settings.max_rounds,
            submission_timeout: Duration::from_secs(self.settings.submission_timeout_seconds),
            judgment_timeout: Duration::from_secs(self.settings.judgment_timeout_seconds),
        };
        // Settings were validated at load; the task re-checks the same bounds.
        task.validate()?;
        self.settings.validate()?;

        tracing::info!(
            execution_id = %task.execution_id,
            teams = task.teams.len(),
            max_rounds = task.max_rounds,
            "starting execution"
        );

        // Build every controller before spawning anything: missing provider
        // credentials and broken configs abort the execution here, before any
        // round runs.
        let mut controllers = Vec::with_capacity(task.teams.len());
        for team in &task.teams {
            let store = AggregationStore::open(&self.db_path)?;
            let controller = RoundController::new(
                &task,
                team.clone(),
                Arc::clone(&self.factory),
                Evaluator::new(self.settings.evaluator.clone(), Arc::clone(&self.factory)),
                ContinuationJudge::new(self.settings.judgment.clone(), Arc::clone(&self.factory)),
                PromptBuilder::new(self.settings.prompt_builder.clone()),
                store,
            )?;
            controllers.push(controller);
        }

        let cancel = CancellationToken::new();
        let mut handles = Vec::with_capacity(controllers.len());
        for (team, controller) in task.teams.iter().zip(controllers) {
            let status = TeamStatus::pending(&team.team_id, &team.team_name);
            let deadline = task.per_team_deadline;
            let token = cancel.child_token();
            handles.push(tokio::spawn(run_team_worker(
                controller, status, deadline, token,
            )));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (team, handle) in task.teams.iter().zip(handles) {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => {
                    // A panicked worker is a failed team, not a failed run.
                    let mut status = TeamStatus::pending(&team.team_id, &team.team_name);
                    status.status = TeamState::Failed;
                    status.error_kind = Some("panic".into());
                    status.error_message = Some(join_error.to_string());
                    status.completed_at = Some(Utc::now());
                    outcomes.push(TeamOutcome {
                        status,
                        rounds: Vec::new(),
                    });
                }
            }
        }

        Ok(assemble_summary(&task, outcomes, started.elapsed()))
    }
}

/// One team's worker: run the round loop under the team deadline.
async fn run_team_worker(
    mut controller: RoundController,
    mut status: TeamStatus,
    deadline: Duration,
    cancel: CancellationToken,
) -> TeamOutcome {
    status.status = TeamState::Running;
    status.started_at = Some(Utc::now());

    let result = tokio::time::timeout(deadline, controller.run_to_completion(&cancel)).await;
    status.completed_at = Some(Utc::now());

    match result {
        Ok(Ok(())) => {
            status.status = TeamState::Completed;
        }
        Ok(Err(error)) => {
            status.status = TeamState::Failed;
            status.error_kind = Some(error.kind().to_string());
            status.error_message = Some(error.to_string());
            tracing::warn!(team_id = %status.team_id, error = %error, "team failed");
        }
        Err(_elapsed) => {
            // Dropping the round future aborts in-flight provider and store
            // calls; partially computed, unpersisted round state is discarded.
            cancel.cancel();
            status.status = TeamState::Timeout;
            status.error_kind = Some("timeout".into());
            status.error_message = Some(format!(
                "team exceeded its deadline of {}s",
                deadline.as_secs()
            ));
            tracing::warn!(team_id = %status.team_id, "team deadline expired");
        }
    }

    let rounds = controller.into_history();
    status.current_round = rounds.len() as u32;
    TeamOutcome { status, rounds }
}

/// Select the best round per team, the best team globally, and the counts.
fn assemble_summary(
    task: &ExecutionTask,
    outcomes: Vec<TeamOutcome>,
    total_execution_time: Duration,
) -> ExecutionSummary {
    let mut team_results = Vec::new();
    let mut team_statuses = Vec::new();
    let mut completed_teams = 0usize;

    for outcome in outcomes {
        if outcome.status.status == TeamState::Completed {
            completed_teams += 1;
        }

        if let Some(best) = best_round(&outcome.rounds) {
            team_results.push(TeamResult {
                team_id: best.team_id.clone(),
                team_name: best.team_name.clone(),
                round_number: best.round_number,
                score: best.evaluation_score,
                submission_content: best.submission_content.clone(),
                usage: best.usage,
            });
        }
        team_statuses.push(outcome.status);
    }

    let total_teams = team_statuses.len();
    let failed_teams = total_teams - completed_teams;

    // Best team globally; absent unless at least one team completed.
    let best_team_id = if completed_teams >= 1 {
        team_results
            .iter()
            .fold(None::<&TeamResult>, |best, candidate| match best {
                None => Some(candidate),
                Some(current)
                    if better_round(
                        candidate.score,
                        candidate.round_number,
                        &candidate.team_id,
                        current.score,
                        current.round_number,
                        &current.team_id,
                    ) =>
                {
                    Some(candidate)
                }
                Some(current) => Some(current),
            })
            .map(|r| r.team_id.clone())
    } else {
        None
    };

    ExecutionSummary {
        execution_id: task.execution_id.clone(),
        user_prompt: task.user_prompt.clone(),
        team_results,
        team_statuses,
        best_team_id,
        total_teams,
        completed_teams,
        failed_teams,
        total_execution_time,
    }
}

fn best_round(rounds: &[RoundState]) -> Option<&RoundState> {
    rounds.iter().fold(None, |best, candidate| match best {
        None => Some(candidate),
        Some(current)
            if better_round(
                candidate.evaluation_score,
                candidate.round_number,
                &candidate.team_id,
                current.evaluation_score,
                current.round_number,
                &current.team_id,
            ) =>
        {
            Some(candidate)
        }
        Some(current) => Some(current),
    })
}

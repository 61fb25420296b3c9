//! Round controller: runs one team through its rounds.
//!
//! Per round: assemble the prompt, invoke the leader under the submission
//! budget, evaluate under the judgment budget, persist (with bounded backoff
//! on transient store errors), then decide whether to continue. This is the
//! single place that classifies failures: a failed persist fails the round,
//! a failed judge fails the team, and the min/max bounds override the judge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::TeamConfig;
use crate::engine::evaluator::Evaluator;
use crate::engine::judge::ContinuationJudge;
use crate::engine::leader::LeaderAgent;
use crate::engine::types::{ExecutionTask, RoundState};
use crate::error::{EngineError, EngineResult, TimeoutScope};
use crate::prompt::{PromptBuilder, PromptContext};
use crate::providers::ProviderFactory;
use crate::store::AggregationStore;

/// Store write retry policy: 3 attempts, exponential backoff from 100 ms.
const STORE_WRITE_ATTEMPTS: u32 = 3;
const STORE_BACKOFF_BASE: Duration = Duration::from_millis(100);

pub struct RoundController {
    execution_id: String,
    user_prompt: String,
    team: TeamConfig,
    leader: LeaderAgent,
    evaluator: Evaluator,
    judge: ContinuationJudge,
    prompt_builder: PromptBuilder,
    store: Mutex<AggregationStore>,
    history: Vec<RoundState>,
    min_rounds: u32,
    max_rounds: u32,
    submission_timeout: Duration,
    judgment_timeout: Duration,
}

impl RoundController {
    /// Build a controller for one team. Opens this worker's own store
    /// connection and constructs the leader with all member agents, so
    /// credential and spawn problems surface before round 1.
    pub fn new(
        task: &ExecutionTask,
        team: TeamConfig,
        factory: Arc<ProviderFactory>,
        evaluator: Evaluator,
        judge: ContinuationJudge,
        prompt_builder: PromptBuilder,
        store: AggregationStore,
    ) -> EngineResult<Self> {
        let leader = LeaderAgent::from_team(&team, &factory)?;
        Ok(Self {
            execution_id: task.execution_id.clone(),
            user_prompt: task.user_prompt.clone(),
            team,
            leader,
            evaluator,
            judge,
            prompt_builder,
            store: Mutex::new(store),
            history: Vec::new(),
            min_rounds: task.min_rounds,
            max_rounds: task.max_rounds,
            submission_timeout: task.submission_timeout,
            judgment_timeout: task.judgment_timeout,
        })
    }

    pub fn history(&self) -> &[RoundState] {
        &self.history
    }

    pub fn into_history(self) -> Vec<RoundState> {
        self.history
    }

    /// Drive the round loop until the judge stops it, the max bound is hit,
    /// or a team-fatal error occurs. Successful rounds stay in `history`
    /// even when a later round fails.
    pub async fn run_to_completion(&mut self, cancel: &CancellationToken) -> EngineResult<()> {
        for round_number in 1..=self.max_rounds {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let round = tokio::select! {
                result = self.run_round(round_number) => result?,
                () = cancel.cancelled() => return Err(EngineError::Cancelled),
            };
            tracing::info!(
                team_id = %round.team_id,
                round = round.round_number,
                score = round.evaluation_score,
                "round persisted"
            );
            self.history.push(round);

            if !self.should_continue(round_number).await? {
                break;
            }
        }
        Ok(())
    }

    /// Run a single round end to end and return the persisted state.
    pub async fn run_round(&self, round_number: u32) -> EngineResult<RoundState> {
        let started = Instant::now();

        // 1. Prompt assembly from a leaderboard snapshot taken now. Stale by
        //    one round is acceptable; no cross-team synchronization.
        let ranking = self.store.lock().leaderboard_ranking(&self.execution_id)?;
        let prompt = self.prompt_builder.build(&PromptContext {
            user_prompt: &self.user_prompt,
            round_number,
            team_id: &self.team.team_id,
            team_name: &self.team.team_name,
            round_history: &self.history,
            ranking: &ranking,
        });

        // 2. Leader invocation under the submission budget.
        let outcome = match tokio::time::timeout(self.submission_timeout, self.leader.run(&prompt))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    scope: TimeoutScope::Submission,
                    elapsed: self.submission_timeout,
                })
            }
        };

        // 3. Evaluation under the judgment budget.
        let evaluation = match tokio::time::timeout(
            self.judgment_timeout,
            self.evaluator.evaluate(
                &self.user_prompt,
                &outcome.submission_content,
                &self.team.team_id,
            ),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    scope: TimeoutScope::Judgment,
                    elapsed: self.judgment_timeout,
                })
            }
        };

        let round = RoundState {
            execution_id: self.execution_id.clone(),
            team_id: self.team.team_id.clone(),
            team_name: self.team.team_name.clone(),
            round_number,
            submission_content: outcome.submission_content,
            member_submissions: outcome.member_submissions,
            message_history: outcome.message_history,
            evaluation_score: evaluation.overall_score,
            evaluation_feedback: evaluation.metrics,
            usage: outcome.usage,
            execution_time: started.elapsed(),
            completed_at: Utc::now(),
        };

        // 4. Persistence. A round that computed but did not persist does not
        //    count.
        retry_store(|| self.store.lock().save_aggregation(&round)).await?;
        retry_store(|| self.store.lock().save_leaderboard_entry(&round)).await?;

        Ok(round)
    }

    /// Continuation decision: bounds first, then the judge.
    /// `min_rounds == max_rounds` never consults the judge.
    async fn should_continue(&self, round_number: u32) -> EngineResult<bool> {
        if round_number < self.min_rounds {
            return Ok(true);
        }
        if round_number >= self.max_rounds {
            return Ok(false);
        }
        let verdict = self.judge.decide(&self.history).await?;
        Ok(verdict.should_continue)
    }
}

/// Retry a store write on transient errors: up to 3 attempts, exponential
/// backoff with base 100 ms and factor 2. Permanent errors (constraint
/// violations) are never retried.
async fn retry_store(mut op: impl FnMut() -> EngineResult<()>) -> EngineResult<()> {
    let mut backoff = STORE_BACKOFF_BASE;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt + 1 < STORE_WRITE_ATTEMPTS => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "transient store error, retrying write");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

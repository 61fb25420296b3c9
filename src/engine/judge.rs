//! Continuation judge: decides whether a team runs another round.
//!
//! One deterministic LLM call over the full round history. Only
//! `should_continue` drives control flow; reasoning and confidence are kept
//! for diagnostics. A judge failure is fatal to the team: without a
//! well-defined stop decision the loop cannot continue.

use std::sync::Arc;
use std::time::Duration;

use crate::config::JudgmentConfig;
use crate::engine::evaluator::extract_json_object;
use crate::engine::types::{JudgeVerdict, RoundState};
use crate::error::{EngineError, EngineResult, TimeoutScope};
use crate::providers::{ProviderFactory, SamplingParams};

/// Deterministic seed for judge calls on providers that honor one.
const JUDGE_SEED: u64 = 0;

const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You decide whether an iterating team should run another improvement round. \
     Analyze the score trend across rounds: clear improvement favors continuing; \
     a plateau or degradation means diminishing returns and you should stop. \
     Respond with a single JSON object: {\"should_continue\": <bool>, \
     \"reasoning\": \"<short trend analysis>\", \"confidence\": <number 0-1>}. \
     Output nothing after the JSON object.";

pub struct ContinuationJudge {
    config: JudgmentConfig,
    factory: Arc<ProviderFactory>,
}

impl ContinuationJudge {
    pub fn new(config: JudgmentConfig, factory: Arc<ProviderFactory>) -> Self {
        Self { config, factory }
    }

    /// Decide from the full history whether to run another round.
    pub async fn decide(&self, history: &[RoundState]) -> EngineResult<JudgeVerdict> {
        let (client, model) = self.factory.client_for(&self.config.model)?;
        let params = SamplingParams {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens.unwrap_or(1024),
            seed: Some(JUDGE_SEED),
        };

        let system = self
            .config
            .system_instruction
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_INSTRUCTION);
        let prompt = history_digest(history);
        let timeout = Duration::from_secs(self.config.timeout_seconds);

        let response = match tokio::time::timeout(
            timeout,
            client.chat_with_system(Some(system), &prompt, &model, params),
        )
        .await
        {
            Ok(result) => result.map_err(|e| EngineError::Judgment(e.to_string()))?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    scope: TimeoutScope::Judgment,
                    elapsed: timeout,
                })
            }
        };

        let text = response.text.unwrap_or_default();
        let verdict = parse_verdict(&text)
            .map_err(|e| EngineError::Judgment(format!("malformed judge verdict: {e}")))?;

        tracing::debug!(
            should_continue = verdict.should_continue,
            confidence = verdict.confidence,
            reasoning = %verdict.reasoning,
            "continuation verdict"
        );
        Ok(verdict)
    }
}

fn history_digest(history: &[RoundState]) -> String {
    use std::fmt::Write as _;
    let mut out = String::from("## Round history\n");
    for round in history {
        let _ = writeln!(
            out,
            "### Round {} — score {:.1}",
            round.round_number, round.evaluation_score
        );
        for feedback in &round.evaluation_feedback {
            let _ = writeln!(out, "- {}: {:.1} — {}", feedback.name, feedback.score, feedback.comment);
        }
        let _ = writeln!(out, "\n{}\n", round.submission_content);
    }
    out.push_str("Should this team run another round?");
    out
}

fn parse_verdict(text: &str) -> Result<JudgeVerdict, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object found".to_string())?;
    let verdict: JudgeVerdict = serde_json::from_str(json).map_err(|e| e.to_string())?;
    if !verdict.confidence.is_finite() || !(0.0..=1.0).contains(&verdict.confidence) {
        return Err(format!("confidence {} is outside [0, 1]", verdict.confidence));
    }
    Ok(verdict)
}

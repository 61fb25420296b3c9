//! Evaluator: LLM-as-judge scoring on weighted metrics.
//!
//! Each configured metric gets its own chain-of-thought judge call at
//! `temperature = 0` with a fixed seed, asked to return a structured JSON
//! object. Scores must be finite reals in [0, 100]; anything else fails the
//! round. Transport errors are retried by the provider layer; malformed
//! output from a successful call is not.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{EvaluatorConfig, MetricConfig};
use crate::engine::types::MetricFeedback;
use crate::error::{EngineError, EngineResult, TimeoutScope};
use crate::providers::{ProviderFactory, SamplingParams};

/// Deterministic seed for judge calls on providers that honor one.
const JUDGE_SEED: u64 = 0;

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub overall_score: f64,
    pub metrics: Vec<MetricFeedback>,
}

pub struct Evaluator {
    config: EvaluatorConfig,
    factory: Arc<ProviderFactory>,
}

#[derive(Debug, serde::Deserialize)]
struct MetricVerdict {
    score: f64,
    #[serde(default)]
    comment: String,
}

impl Evaluator {
    pub fn new(config: EvaluatorConfig, factory: Arc<ProviderFactory>) -> Self {
        Self { config, factory }
    }

    /// Score a submission against the original user query.
    pub async fn evaluate(
        &self,
        user_query: &str,
        submission: &str,
        team_id: &str,
    ) -> EngineResult<EvaluationResult> {
        let weights = self.config.effective_weights();
        let timeout = Duration::from_secs(self.config.timeout_seconds);

        let mut metrics = Vec::with_capacity(self.config.metrics.len());
        let mut overall_score = 0.0;

        for (metric, weight) in self.config.metrics.iter().zip(weights) {
            let feedback = match tokio::time::timeout(
                timeout,
                self.score_metric(metric, user_query, submission, team_id),
            )
            .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(EngineError::Timeout {
                        scope: TimeoutScope::Judgment,
                        elapsed: timeout,
                    })
                }
            };
            overall_score += feedback.score * weight;
            metrics.push(feedback);
        }

        Ok(EvaluationResult {
            overall_score,
            metrics,
        })
    }

    async fn score_metric(
        &self,
        metric: &MetricConfig,
        user_query: &str,
        submission: &str,
        team_id: &str,
    ) -> EngineResult<MetricFeedback> {
        let model_id = metric.model.as_deref().unwrap_or(&self.config.default_model);
        let (client, model) = self.factory.client_for(model_id)?;

        let params = SamplingParams {
            temperature: metric.temperature.unwrap_or(self.config.temperature),
            max_tokens: metric.max_tokens.unwrap_or(self.config.max_tokens),
            seed: Some(JUDGE_SEED),
        };

        let system = metric
            .system_instruction
            .clone()
            .unwrap_or_else(|| default_metric_instruction(&metric.name));
        let prompt = metric_prompt(&metric.name, user_query, submission, team_id);

        let response = client
            .chat_with_system(Some(&system), &prompt, &model, params)
            .await?;
        let text = response.text.unwrap_or_default();

        let verdict = parse_metric_verdict(&text).map_err(|e| {
            EngineError::Evaluation(format!(
                "metric '{}' returned an unparseable verdict: {e}",
                metric.name
            ))
        })?;

        if !verdict.score.is_finite() || !(0.0..=100.0).contains(&verdict.score) {
            return Err(EngineError::Evaluation(format!(
                "metric '{}' score {} is outside [0, 100]",
                metric.name, verdict.score
            )));
        }

        Ok(MetricFeedback {
            name: metric.name.clone(),
            score: verdict.score,
            comment: verdict.comment,
        })
    }
}

fn default_metric_instruction(metric_name: &str) -> String {
    format!(
        "You are an exacting evaluation judge scoring one submission on the \
         '{metric_name}' metric. Think through the submission's strengths and \
         weaknesses step by step, then respond with a single JSON object: \
         {{\"score\": <number 0-100>, \"comment\": \"<one-sentence justification>\"}}. \
         Output nothing after the JSON object."
    )
}

fn metric_prompt(metric_name: &str, user_query: &str, submission: &str, team_id: &str) -> String {
    format!(
        "## Metric\n{metric_name}\n\n## Original task\n{user_query}\n\n\
         ## Submission (team {team_id})\n{submission}\n\n\
         Score the submission on this metric from 0 to 100."
    )
}

/// Extract the first JSON object from judge output. Models sometimes wrap
/// the object in prose or a code fence; everything outside the outermost
/// braces is ignored.
fn parse_metric_verdict(text: &str) -> Result<MetricVerdict, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str(json).map_err(|e| e.to_string())
}

pub(crate) fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatRequest, ChatResponse, Provider, TokenUsage};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Judge provider that replies with a fixed body per call, FIFO.
    struct ScriptedJudge {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Provider for ScriptedJudge {
        async fn chat(
            &self,
            _request: ChatRequest<'_>,
            _model: &str,
            _params: SamplingParams,
        ) -> EngineResult<ChatResponse> {
            let mut guard = self.replies.lock();
            let body = if guard.is_empty() {
                r#"{"score": 50, "comment": "default"}"#.to_string()
            } else {
                guard.remove(0)
            };
            Ok(ChatResponse {
                text: Some(body),
                tool_calls: vec![],
                usage: TokenUsage::single_request(1, 1),
            })
        }

        fn name(&self) -> &str {
            "judge"
        }
    }

    fn evaluator_with(replies: Vec<&str>, metrics: Vec<MetricConfig>) -> Evaluator {
        let factory = ProviderFactory::new(0);
        factory.register(
            "judge",
            Arc::new(ScriptedJudge {
                replies: Mutex::new(replies.into_iter().map(String::from).collect()),
            }),
        );
        Evaluator::new(
            EvaluatorConfig {
                default_model: "judge:eval-model".into(),
                temperature: 0.0,
                max_tokens: 2048,
                max_retries: 3,
                timeout_seconds: 30,
                metrics,
            },
            Arc::new(factory),
        )
    }

    fn metric(name: &str, weight: Option<f64>) -> MetricConfig {
        MetricConfig {
            name: name.into(),
            weight,
            model: None,
            temperature: None,
            max_tokens: None,
            system_instruction: None,
        }
    }

    #[tokio::test]
    async fn weighted_aggregation_with_explicit_weights() {
        // A: weight 0.6 scores 80; B: weight 0.4 scores 60 => 72.0 exactly.
        let evaluator = evaluator_with(
            vec![
                r#"{"score": 80, "comment": "solid"}"#,
                r#"{"score": 60, "comment": "thin"}"#,
            ],
            vec![metric("A", Some(0.6)), metric("B", Some(0.4))],
        );
        let result = evaluator.evaluate("query", "submission", "alpha").await.unwrap();
        assert!((result.overall_score - 72.0).abs() < 1e-6);
        assert_eq!(result.metrics.len(), 2);
        assert_eq!(result.metrics[0].name, "A");
        assert_eq!(result.metrics[1].score, 60.0);
    }

    #[tokio::test]
    async fn uniform_weights_when_absent() {
        let evaluator = evaluator_with(
            vec![
                r#"{"score": 90, "comment": ""}"#,
                r#"{"score": 60, "comment": ""}"#,
            ],
            vec![metric("A", None), metric("B", None)],
        );
        let result = evaluator.evaluate("q", "s", "alpha").await.unwrap();
        assert!((result.overall_score - 75.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn json_wrapped_in_prose_still_parses() {
        let evaluator = evaluator_with(
            vec!["Thinking it over...\n```json\n{\"score\": 88, \"comment\": \"good\"}\n```"],
            vec![metric("Relevance", None)],
        );
        let result = evaluator.evaluate("q", "s", "alpha").await.unwrap();
        assert!((result.overall_score - 88.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn out_of_range_score_fails_evaluation() {
        let evaluator = evaluator_with(
            vec![r#"{"score": 120, "comment": "overenthusiastic"}"#],
            vec![metric("Relevance", None)],
        );
        let err = evaluator.evaluate("q", "s", "alpha").await.unwrap_err();
        assert_eq!(err.kind(), "evaluation");
    }

    #[tokio::test]
    async fn unparseable_output_fails_evaluation() {
        let evaluator = evaluator_with(
            vec!["I give it a solid B+"],
            vec![metric("Relevance", None)],
        );
        let err = evaluator.evaluate("q", "s", "alpha").await.unwrap_err();
        assert_eq!(err.kind(), "evaluation");
    }

    #[tokio::test]
    async fn nan_score_is_rejected() {
        let evaluator = evaluator_with(
            vec![r#"{"score": 1e999, "comment": "inf"}"#],
            vec![metric("Relevance", None)],
        );
        let err = evaluator.evaluate("q", "s", "alpha").await.unwrap_err();
        assert_eq!(err.kind(), "evaluation");
    }

    #[test]
    fn json_extraction_handles_nesting_and_strings() {
        assert_eq!(
            extract_json_object(r#"noise {"a": {"b": 1}} trailing"#),
            Some(r#"{"a": {"b": 1}}"#)
        );
        assert_eq!(
            extract_json_object(r#"{"s": "braces } in { string"}"#),
            Some(r#"{"s": "braces } in { string"}"#)
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{unclosed"), None);
    }

    #[test]
    fn boundary_scores_are_accepted() {
        for body in [r#"{"score": 0}"#, r#"{"score": 100}"#] {
            let verdict = parse_metric_verdict(body).unwrap();
            assert!((0.0..=100.0).contains(&verdict.score));
        }
    }
}

//! Prompt builder: a pure function from round context to the team prompt.
//!
//! Round 1 gets the raw user prompt. Later rounds get the configured template
//! with the task restatement, the team's full (untruncated) round history,
//! a leaderboard snapshot taken at call time, a positional message, and the
//! improvement directive.

use chrono::Local;
use std::fmt::Write as _;

use crate::config::PromptBuilderConfig;
use crate::engine::types::{LeaderboardEntry, RoundState};

/// Everything the builder needs for one prompt. The leaderboard slice is the
/// snapshot the caller read from the store; stale-by-one-round is acceptable.
pub struct PromptContext<'a> {
    pub user_prompt: &'a str,
    pub round_number: u32,
    pub team_id: &'a str,
    pub team_name: &'a str,
    pub round_history: &'a [RoundState],
    pub ranking: &'a [LeaderboardEntry],
}

pub struct PromptBuilder {
    config: PromptBuilderConfig,
}

impl PromptBuilder {
    pub fn new(config: PromptBuilderConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, ctx: &PromptContext<'_>) -> String {
        if ctx.round_number <= 1 {
            return ctx.user_prompt.to_string();
        }

        let now = Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string();

        self.config
            .template
            .replace("{{ user_prompt }}", ctx.user_prompt)
            .replace("{{ round_number }}", &ctx.round_number.to_string())
            .replace(
                "{{ submission_history }}",
                &submission_history(ctx.round_history),
            )
            .replace(
                "{{ ranking_table }}",
                &ranking_table(ctx.ranking, ctx.team_id),
            )
            .replace(
                "{{ team_position_message }}",
                &position_message(ctx.ranking, ctx.team_id, ctx.team_name),
            )
            .replace("{{ current_datetime }}", &now)
            .replace(
                "{{ improvement_directive }}",
                &self.config.improvement_directive,
            )
    }
}

/// Integrated history of every prior round: number, score, per-metric
/// feedback, and the full submission. Never truncated.
fn submission_history(history: &[RoundState]) -> String {
    if history.is_empty() {
        return "(no previous rounds)".to_string();
    }
    let mut out = String::new();
    for round in history {
        let _ = writeln!(
            out,
            "### Round {} — score {:.1}",
            round.round_number, round.evaluation_score
        );
        for feedback in &round.evaluation_feedback {
            let _ = writeln!(
                out,
                "- {}: {:.1} — {}",
                feedback.name, feedback.score, feedback.comment
            );
        }
        let _ = writeln!(out, "\n{}\n", round.submission_content);
    }
    out.trim_end().to_string()
}

/// Ranking across all teams, with the current team marked.
fn ranking_table(ranking: &[LeaderboardEntry], team_id: &str) -> String {
    if ranking.is_empty() {
        return "(no scores recorded yet)".to_string();
    }
    let mut out = String::new();
    for (index, entry) in ranking.iter().enumerate() {
        let marker = if entry.team_id == team_id {
            "  <- you"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "{}. {} ({}) — best score {:.1} in round {}{}",
            index + 1,
            entry.team_name,
            entry.team_id,
            entry.score,
            entry.round_number,
            marker
        );
    }
    out.trim_end().to_string()
}

/// Positional message: 1st congratulatory, top-3 "excellent", else neutral.
fn position_message(ranking: &[LeaderboardEntry], team_id: &str, team_name: &str) -> String {
    let position = ranking.iter().position(|e| e.team_id == team_id);
    match position {
        Some(0) => format!(
            "Congratulations, {team_name} — you are currently in 1st place. Defend your lead."
        ),
        Some(p) if p < 3 => format!(
            "Excellent work, {team_name} — you are currently ranked {}. The top spot is within reach.",
            p + 1
        ),
        Some(p) => format!(
            "{team_name}, you are currently ranked {} of {}. There is room to climb.",
            p + 1,
            ranking.len()
        ),
        None => format!("{team_name}, no score is recorded for you yet."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::types::MetricFeedback;
    use crate::providers::TokenUsage;
    use chrono::Utc;
    use std::time::Duration;

    fn round(round_number: u32, score: f64, submission: &str) -> RoundState {
        RoundState {
            execution_id: "exec-1".into(),
            team_id: "alpha".into(),
            team_name: "Alpha".into(),
            round_number,
            submission_content: submission.to_string(),
            member_submissions: vec![],
            message_history: serde_json::json!({"version": 1, "messages": []}),
            evaluation_score: score,
            evaluation_feedback: vec![MetricFeedback {
                name: "Relevance".into(),
                score,
                comment: "focused".into(),
            }],
            usage: TokenUsage::default(),
            execution_time: Duration::from_secs(1),
            completed_at: Utc::now(),
        }
    }

    fn entry(team_id: &str, score: f64) -> LeaderboardEntry {
        LeaderboardEntry {
            execution_id: "exec-1".into(),
            team_id: team_id.into(),
            team_name: format!("Team {team_id}"),
            round_number: 1,
            score,
            submission_excerpt: String::new(),
        }
    }

    #[test]
    fn round_one_returns_raw_prompt() {
        let builder = PromptBuilder::new(PromptBuilderConfig::default());
        let ctx = PromptContext {
            user_prompt: "Summarize the word 'hello'.",
            round_number: 1,
            team_id: "alpha",
            team_name: "Alpha",
            round_history: &[],
            ranking: &[],
        };
        assert_eq!(builder.build(&ctx), "Summarize the word 'hello'.");
    }

    #[test]
    fn later_rounds_fill_every_placeholder() {
        let builder = PromptBuilder::new(PromptBuilderConfig::default());
        let history = vec![round(1, 70.0, "first attempt")];
        let ranking = vec![entry("alpha", 70.0), entry("beta", 60.0)];
        let ctx = PromptContext {
            user_prompt: "Summarize the word 'hello'.",
            round_number: 2,
            team_id: "alpha",
            team_name: "Alpha",
            round_history: &history,
            ranking: &ranking,
        };
        let prompt = builder.build(&ctx);

        assert!(prompt.contains("Summarize the word 'hello'."));
        assert!(prompt.contains("Round 2"));
        assert!(prompt.contains("first attempt"));
        assert!(prompt.contains("<- you"));
        assert!(prompt.contains("1st place"));
        assert!(!prompt.contains("{{"), "unfilled placeholder in: {prompt}");
    }

    #[test]
    fn history_includes_all_rounds_untruncated() {
        let long_submission = "long ".repeat(2000);
        let history = vec![round(1, 55.0, &long_submission), round(2, 65.0, "second")];
        let digest = submission_history(&history);
        assert!(digest.contains(long_submission.trim_end()));
        assert!(digest.contains("Round 1"));
        assert!(digest.contains("Round 2"));
        assert!(digest.contains("Relevance"));
    }

    #[test]
    fn position_message_tiers() {
        let ranking = vec![
            entry("a", 90.0),
            entry("b", 80.0),
            entry("c", 70.0),
            entry("d", 60.0),
        ];
        assert!(position_message(&ranking, "a", "A").contains("1st place"));
        assert!(position_message(&ranking, "b", "B").contains("Excellent"));
        assert!(position_message(&ranking, "c", "C").contains("Excellent"));
        assert!(position_message(&ranking, "d", "D").contains("ranked 4 of 4"));
        assert!(position_message(&ranking, "zz", "Z").contains("no score"));
    }

    #[test]
    fn empty_ranking_renders_placeholder_text() {
        assert_eq!(ranking_table(&[], "alpha"), "(no scores recorded yet)");
        assert_eq!(submission_history(&[]), "(no previous rounds)");
    }

    #[test]
    fn custom_template_is_honored() {
        let config = PromptBuilderConfig {
            template: "R{{ round_number }}: {{ user_prompt }}".into(),
            improvement_directive: String::new(),
        };
        let builder = PromptBuilder::new(config);
        let ctx = PromptContext {
            user_prompt: "task",
            round_number: 3,
            team_id: "alpha",
            team_name: "Alpha",
            round_history: &[],
            ranking: &[],
        };
        assert_eq!(builder.build(&ctx), "R3: task");
    }
}

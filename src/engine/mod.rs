pub mod evaluator;
pub mod judge;
pub mod leader;
pub mod member;
pub mod orchestrator;
pub mod round;
pub mod types;

pub use evaluator::{EvaluationResult, Evaluator};
pub use judge::ContinuationJudge;
pub use leader::{LeaderAgent, LeaderOutcome};
pub use member::{create_member_agent, MemberAgent, MemberOutput};
pub use orchestrator::Orchestrator;
pub use round::RoundController;
pub use types::{
    ExecutionSummary, ExecutionTask, JudgeVerdict, LeaderboardEntry, MemberSubmission,
    MetricFeedback, RoundState, SubmissionStatus, TeamResult, TeamState, TeamStatus,
};

//! Tagged error taxonomy for the execution kernel.
//!
//! Every failure that crosses a component boundary is classified into one of
//! these kinds. The round controller is the single place that decides which
//! kinds are fatal to the round, fatal to the team, or retryable; everything
//! below it just reports what happened.

use std::time::Duration;

/// Scope a timeout applied to, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// Leader invocation exceeded `submission_timeout`.
    Submission,
    /// Evaluator or judge exceeded `judgment_timeout`.
    Judgment,
    /// The team's entire multi-round execution exceeded `per_team_deadline`.
    Team,
}

impl std::fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submission => write!(f, "submission"),
            Self::Judgment => write!(f, "judgment"),
            Self::Team => write!(f, "team"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing required field, invalid value, unresolvable reference.
    /// Surfaced at startup; prevents execution.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Missing or rejected provider credentials. Never retried, never
    /// substituted with a mock.
    #[error("authentication error for provider '{provider}': {message}")]
    Authentication { provider: String, message: String },

    /// 429/5xx/network/read-timeout from a model provider. Retried per policy.
    #[error("transient provider error: {0}")]
    ProviderTransient(String),

    /// 4xx schema/argument errors, unsupported capability. Fails the phase.
    #[error("permanent provider error: {0}")]
    ProviderPermanent(String),

    /// Judge returned malformed or out-of-range scores after retries.
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Continuation judge unavailable or malformed. Fatal to the team.
    #[error("judgment error: {0}")]
    Judgment(String),

    /// Transient store write/read error (SQLITE_BUSY and friends).
    #[error("transient store error: {0}")]
    StoreTransient(String),

    /// Constraint violations, corruption. Fails the round; never retried.
    #[error("permanent store error: {0}")]
    StorePermanent(String),

    /// A deadline expired. Fails the scope it applied to.
    #[error("{scope} timed out after {elapsed:?}")]
    Timeout {
        scope: TimeoutScope,
        elapsed: Duration,
    },

    /// Propagated cancellation; clean exit path.
    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short machine-readable kind label, persisted with team status.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Authentication { .. } => "authentication",
            Self::ProviderTransient(_) => "provider_transient",
            Self::ProviderPermanent(_) => "provider_permanent",
            Self::Evaluation(_) => "evaluation",
            Self::Judgment(_) => "judgment",
            Self::StoreTransient(_) => "store_transient",
            Self::StorePermanent(_) => "store_permanent",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the retry policy may re-attempt the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ProviderTransient(_) | Self::StoreTransient(_))
    }
}

/// Classify an HTTP status from a provider into transient vs permanent.
///
/// 429 and 408 are rate-limit/timeout conditions that resolve on their own;
/// other 4xx codes indicate a malformed request and will not.
pub fn provider_error_from_status(status: u16, body: &str) -> EngineError {
    let message = format!("HTTP {status}: {body}");
    if status == 429 || status == 408 || status >= 500 {
        EngineError::ProviderTransient(message)
    } else {
        EngineError::ProviderPermanent(message)
    }
}

/// Classify a reqwest transport failure. Connection and timeout errors are
/// transient; anything else (bad URL, TLS config) is permanent.
pub fn provider_error_from_reqwest(err: reqwest::Error) -> EngineError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        EngineError::ProviderTransient(err.to_string())
    } else {
        EngineError::ProviderPermanent(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

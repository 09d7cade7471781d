//! Error taxonomy for the alerting engine

use crate::models::AlertStatus;
use thiserror::Error;

/// Errors surfaced by evaluation, aggregation, dispatch and analysis.
///
/// Evaluation errors are scoped to one rule group, dispatch errors to one
/// channel step, and analysis errors only degrade the analysis result.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Not enough samples to compute a dynamic threshold
    #[error("insufficient data for {series}: have {have} samples, need {need}")]
    InsufficientData {
        series: String,
        have: usize,
        need: usize,
    },

    /// A condition could not be decided this cycle
    #[error("condition unknown for {series}: {reason}")]
    ConditionUnknown { series: String, reason: String },

    /// A notification channel rejected or failed a delivery
    #[error("delivery via channel {channel} failed: {reason}")]
    ChannelSendFailure {
        channel: String,
        reason: String,
        retryable: bool,
    },

    /// The AI capability timed out or failed after retries
    #[error("AI analysis unavailable: {0}")]
    AiAnalysisUnavailable(String),

    /// A rule failed validation at authoring time
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRuleDefinition { rule_id: String, reason: String },

    #[error("alert {0} not found")]
    AlertNotFound(String),

    #[error("cannot {action} alert {id} in status {status}")]
    InvalidTransition {
        id: String,
        status: AlertStatus,
        action: &'static str,
    },

    #[error("alert {0} is not firing")]
    AlertNotFiring(String),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl EngineError {
    /// Errors that make an evaluation cycle inconclusive rather than false
    pub fn is_inconclusive(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientData { .. } | EngineError::ConditionUnknown { .. }
        )
    }

    pub(crate) fn invalid_rule(rule_id: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidRuleDefinition {
            rule_id: rule_id.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

//! Pluggable anomaly scoring
//!
//! Detectors score the current value of a series against its recent window:
//! - Z-score against the rolling mean and standard deviation
//! - Trend growth via linear regression (leak-like patterns)
//!
//! A detector error always means "score unavailable", never an anomaly.

mod trend;
mod zscore;

use crate::ingest::{SeriesKey, SeriesWindow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub use trend::{TrendAnalysis, TrendDetector};
pub use zscore::ZScoreDetector;

/// Result of scoring one value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyScore {
    pub is_anomaly: bool,
    /// Normalized to `[0, 1]`
    pub score: f64,
    pub confidence: f64,
}

/// Inputs available to a detector beyond the value itself
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub window: SeriesWindow,
}

#[derive(Debug, Clone, Error)]
pub enum DetectorError {
    #[error("insufficient samples: have {have}, need {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("window is degenerate: {0}")]
    Degenerate(String),

    #[error("detector backend failed: {0}")]
    Backend(String),
}

/// Scores values of a series for anomalies
#[async_trait]
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(
        &self,
        key: &SeriesKey,
        value: f64,
        ctx: &DetectionContext,
    ) -> Result<AnomalyScore, DetectorError>;
}

/// Score a value, rejecting non-finite output and clamping into range.
///
/// Callers treat every error as "score unavailable".
pub async fn checked_score(
    detector: &dyn AnomalyDetector,
    key: &SeriesKey,
    value: f64,
    ctx: &DetectionContext,
) -> Result<AnomalyScore, DetectorError> {
    let score = detector.score(key, value, ctx).await.map_err(|e| {
        debug!(detector = detector.name(), series = %key, error = %e, "Anomaly score unavailable");
        e
    })?;

    if !score.score.is_finite() || !score.confidence.is_finite() {
        return Err(DetectorError::Backend(format!(
            "{} returned a non-finite score",
            detector.name()
        )));
    }

    Ok(AnomalyScore {
        is_anomaly: score.is_anomaly,
        score: score.score.clamp(0.0, 1.0),
        confidence: score.confidence.clamp(0.0, 1.0),
    })
}

/// Built-in detector selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    #[default]
    ZScore,
    Trend,
}

pub fn build_detector(kind: DetectorKind) -> Arc<dyn AnomalyDetector> {
    match kind {
        DetectorKind::ZScore => Arc::new(ZScoreDetector::default()),
        DetectorKind::Trend => Arc::new(TrendDetector::default()),
    }
}

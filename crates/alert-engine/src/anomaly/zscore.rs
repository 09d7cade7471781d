//! Z-score anomaly detection
//!
//! Scores a value by how many standard deviations it sits from the mean of
//! the series window.

use super::{AnomalyDetector, AnomalyScore, DetectionContext, DetectorError};
use crate::ingest::SeriesKey;
use crate::threshold::WindowStats;
use async_trait::async_trait;

/// Minimum samples required for detection
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Flags values exceeding a standard deviation threshold
#[derive(Debug, Clone)]
pub struct ZScoreDetector {
    /// Number of standard deviations to consider anomalous
    pub std_dev_threshold: f64,
    pub min_samples: usize,
}

impl ZScoreDetector {
    pub fn new(std_dev_threshold: f64) -> Self {
        Self {
            std_dev_threshold,
            min_samples: MIN_SAMPLES_FOR_DETECTION,
        }
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Score a value against precomputed window statistics
    pub fn score_stats(&self, value: f64, stats: &WindowStats) -> Result<AnomalyScore, DetectorError> {
        if stats.count < self.min_samples {
            return Err(DetectorError::InsufficientData {
                have: stats.count,
                need: self.min_samples,
            });
        }

        let z = stats
            .z_score(value)
            .ok_or_else(|| DetectorError::Degenerate("zero variance".to_string()))?
            .abs();

        // z at the threshold maps to 0.5
        let score = (z / (2.0 * self.std_dev_threshold)).min(1.0);
        let confidence = stats.count as f64 / (stats.count + self.min_samples) as f64;

        Ok(AnomalyScore {
            is_anomaly: z > self.std_dev_threshold,
            score,
            confidence,
        })
    }
}

impl Default for ZScoreDetector {
    fn default() -> Self {
        Self::new(3.0)
    }
}

#[async_trait]
impl AnomalyDetector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "zscore"
    }

    async fn score(
        &self,
        _key: &SeriesKey,
        value: f64,
        ctx: &DetectionContext,
    ) -> Result<AnomalyScore, DetectorError> {
        let stats = WindowStats::from_window(&ctx.window).ok_or(DetectorError::InsufficientData {
            have: 0,
            need: self.min_samples,
        })?;
        self.score_stats(value, &stats)
    }
}

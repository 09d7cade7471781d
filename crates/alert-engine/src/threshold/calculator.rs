//! Threshold computation for static, dynamic and AI conditions

use super::stats::{seasonal_factor, WindowStats};
use crate::anomaly::{checked_score, AnomalyDetector, DetectionContext, DetectorError};
use crate::error::{EngineError, EngineResult};
use crate::ingest::{IngestBuffer, Sample, SeriesKey};
use crate::models::Threshold;
use crate::rules::{BaselineMethod, ThresholdSpec};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Default lookback handed to anomaly detectors
const DEFAULT_DETECTOR_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Computes the threshold in effect for a series at evaluation time.
///
/// Baselines are built from samples strictly older than the sample under
/// evaluation, so a spike never widens its own bounds.
pub struct ThresholdCalculator {
    buffer: Arc<IngestBuffer>,
    detector: Arc<dyn AnomalyDetector>,
    detector_window: Duration,
}

impl ThresholdCalculator {
    pub fn new(buffer: Arc<IngestBuffer>, detector: Arc<dyn AnomalyDetector>) -> Self {
        Self {
            buffer,
            detector,
            detector_window: DEFAULT_DETECTOR_WINDOW,
        }
    }

    pub fn with_detector_window(mut self, window: Duration) -> Self {
        self.detector_window = window;
        self
    }

    pub async fn compute(
        &self,
        key: &SeriesKey,
        spec: &ThresholdSpec,
        sample: Sample,
        now: DateTime<Utc>,
    ) -> EngineResult<Threshold> {
        match spec {
            ThresholdSpec::Static { value, lower } => Ok(Threshold {
                upper: Some(*value),
                lower: Some(lower.unwrap_or(*value)),
                baseline: Some(*value),
                std_dev: None,
                score: None,
                confidence: 1.0,
            }),
            ThresholdSpec::Dynamic {
                sensitivity,
                window_secs,
                baseline,
                min_samples,
            } => self.dynamic(
                key,
                sample,
                now,
                *sensitivity,
                Duration::from_secs(*window_secs),
                *baseline,
                *min_samples,
            ),
            ThresholdSpec::Ai { .. } => self.ai(key, sample, now).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dynamic(
        &self,
        key: &SeriesKey,
        sample: Sample,
        now: DateTime<Utc>,
        sensitivity: f64,
        window: Duration,
        method: BaselineMethod,
        min_samples: usize,
    ) -> EngineResult<Threshold> {
        let mut window = self.buffer.window(key, window, now);
        window.samples.retain(|s| s.timestamp < sample.timestamp);

        if window.len() < min_samples {
            return Err(EngineError::InsufficientData {
                series: key.to_string(),
                have: window.len(),
                need: min_samples,
            });
        }

        let stats = WindowStats::from_window(&window).ok_or_else(|| EngineError::InsufficientData {
            series: key.to_string(),
            have: 0,
            need: min_samples,
        })?;

        let baseline = match method {
            BaselineMethod::Mean => stats.mean,
            BaselineMethod::Median => stats.median,
            BaselineMethod::Seasonal => {
                stats.mean * seasonal_factor(&self.buffer.history(key), now, min_samples)
            }
        };
        let band = sensitivity * stats.std_dev;

        Ok(Threshold {
            upper: Some(baseline + band),
            lower: Some(baseline - band),
            baseline: Some(baseline),
            std_dev: Some(stats.std_dev),
            score: None,
            confidence: stats.count as f64 / (stats.count + min_samples) as f64,
        })
    }

    async fn ai(&self, key: &SeriesKey, sample: Sample, now: DateTime<Utc>) -> EngineResult<Threshold> {
        let mut window = self.buffer.window(key, self.detector_window, now);
        window.samples.retain(|s| s.timestamp < sample.timestamp);
        let ctx = DetectionContext { window };

        match checked_score(self.detector.as_ref(), key, sample.value, &ctx).await {
            Ok(score) => Ok(Threshold {
                score: Some(score.score),
                confidence: score.confidence,
                ..Default::default()
            }),
            Err(DetectorError::InsufficientData { have, need }) => Err(EngineError::InsufficientData {
                series: key.to_string(),
                have,
                need,
            }),
            Err(e) => Err(EngineError::ConditionUnknown {
                series: key.to_string(),
                reason: format!("anomaly score unavailable: {}", e),
            }),
        }
    }
}

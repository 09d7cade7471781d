//! Trend-based anomaly detection
//!
//! Flags sustained growth (leak-like patterns) by fitting a linear regression
//! over the window and requiring the series to be mostly monotonic.

use super::{AnomalyDetector, AnomalyScore, DetectionContext, DetectorError};
use crate::ingest::{Sample, SeriesKey};
use async_trait::async_trait;

/// Minimum samples required for trend detection
const MIN_SAMPLES_FOR_DETECTION: usize = 10;

/// Fraction of steps that must be non-decreasing
const MONOTONICITY_THRESHOLD: f64 = 0.95;

/// Detects sustained growth via linear regression
#[derive(Debug, Clone)]
pub struct TrendDetector {
    /// Minimum slope (units per second) to consider a trend
    pub slope_threshold: f64,
    pub monotonicity_threshold: f64,
    pub min_samples: usize,
    /// Optional ceiling used to project when the trend crosses it
    pub limit: Option<f64>,
}

impl TrendDetector {
    pub fn new(slope_threshold: f64) -> Self {
        Self {
            slope_threshold,
            monotonicity_threshold: MONOTONICITY_THRESHOLD,
            min_samples: MIN_SAMPLES_FOR_DETECTION,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: f64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_min_samples(mut self, min_samples: usize) -> Self {
        self.min_samples = min_samples;
        self
    }

    /// Fit the trend over time-ordered samples
    pub fn analyze(&self, samples: &[Sample]) -> Result<TrendAnalysis, DetectorError> {
        let need = self.min_samples.max(2);
        if samples.len() < need {
            return Err(DetectorError::InsufficientData {
                have: samples.len(),
                need,
            });
        }

        let points = normalize(samples);
        let slope = linear_regression_slope(&points);
        let r_squared = r_squared(&points, slope);
        let monotonicity = monotonicity(&points);

        let seconds_to_limit = self.limit.and_then(|limit| {
            let (_, current) = *points.last()?;
            if current >= limit {
                Some(0.0)
            } else if slope > 0.0 {
                Some((limit - current) / slope)
            } else {
                None
            }
        });

        Ok(TrendAnalysis {
            slope_per_sec: slope,
            r_squared,
            monotonicity,
            seconds_to_limit,
            samples_analyzed: points.len(),
        })
    }
}

impl Default for TrendDetector {
    fn default() -> Self {
        Self::new(0.0)
    }
}

#[async_trait]
impl AnomalyDetector for TrendDetector {
    fn name(&self) -> &'static str {
        "trend"
    }

    async fn score(
        &self,
        _key: &SeriesKey,
        _value: f64,
        ctx: &DetectionContext,
    ) -> Result<AnomalyScore, DetectorError> {
        let trend = self.analyze(&ctx.window.samples)?;
        let growing = trend.slope_per_sec > self.slope_threshold
            && trend.monotonicity >= self.monotonicity_threshold;

        let score = if trend.slope_per_sec > self.slope_threshold {
            (trend.r_squared * trend.monotonicity).clamp(0.0, 1.0)
        } else {
            0.0
        };

        Ok(AnomalyScore {
            is_anomaly: growing,
            score,
            confidence: trend.r_squared.clamp(0.0, 1.0),
        })
    }
}

/// Fitted trend details
#[derive(Debug, Clone)]
pub struct TrendAnalysis {
    pub slope_per_sec: f64,
    /// Coefficient of determination of the linear fit
    pub r_squared: f64,
    pub monotonicity: f64,
    /// Seconds until the configured limit is reached, if growing
    pub seconds_to_limit: Option<f64>,
    pub samples_analyzed: usize,
}

impl TrendAnalysis {
    pub fn rate_per_hour(&self) -> f64 {
        self.slope_per_sec * 3600.0
    }
}

/// (seconds since first sample, value)
fn normalize(samples: &[Sample]) -> Vec<(f64, f64)> {
    let t0 = samples[0].timestamp;
    samples
        .iter()
        .map(|s| {
            let x = (s.timestamp - t0).num_milliseconds() as f64 / 1000.0;
            (x, s.value)
        })
        .collect()
}

fn linear_regression_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    if n < 2.0 {
        return 0.0;
    }

    let mut sum_x = 0.0;
    let mut sum_y = 0.0;
    let mut sum_xy = 0.0;
    let mut sum_xx = 0.0;
    for (x, y) in points {
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return 0.0;
    }
    (n * sum_xy - sum_x * sum_y) / denominator
}

fn r_squared(points: &[(f64, f64)], slope: f64) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    let n = points.len() as f64;
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    for (x, y) in points {
        let predicted = slope * x + intercept;
        ss_res += (y - predicted).powi(2);
        ss_tot += (y - mean_y).powi(2);
    }

    if ss_tot.abs() < f64::EPSILON {
        return 0.0;
    }
    1.0 - (ss_res / ss_tot)
}

fn monotonicity(points: &[(f64, f64)]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let increasing = points.windows(2).filter(|w| w[1].1 >= w[0].1).count();
    increasing as f64 / (points.len() - 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::SeriesWindow;
    use crate::models::Labels;
    use chrono::{Duration, TimeZone, Utc};

    fn series(values: impl Iterator<Item = f64>) -> Vec<Sample> {
        let t0 = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        values
            .enumerate()
            .map(|(i, value)| Sample {
                timestamp: t0 + Duration::seconds(i as i64 * 60),
                value,
            })
            .collect()
    }

    fn ctx(samples: Vec<Sample>) -> DetectionContext {
        DetectionContext {
            window: SeriesWindow {
                key: SeriesKey::new("mem", Labels::new()),
                samples,
            },
        }
    }

    #[tokio::test]
    async fn test_flat_series_is_not_anomalous() {
        let detector = TrendDetector::new(1.0);
        let key = SeriesKey::new("mem", Labels::new());
        let score = detector
            .score(&key, 100.0, &ctx(series((0..60).map(|_| 100.0))))
            .await
            .unwrap();
        assert!(!score.is_anomaly);
        assert_eq!(score.score, 0.0);
    }

    #[tokio::test]
    async fn test_detect_clear_growth() {
        let detector = TrendDetector::new(1000.0);
        let key = SeriesKey::new("mem", Labels::new());
        let samples = series((0..60).map(|i| 100_000_000.0 + i as f64 * 600_000.0));

        let score = detector.score(&key, 0.0, &ctx(samples)).await.unwrap();
        assert!(score.is_anomaly);
        assert!(score.score > 0.9);
        assert!(score.confidence > 0.9);
    }

    #[tokio::test]
    async fn test_oscillation_rejected() {
        let detector = TrendDetector::new(0.0);
        let key = SeriesKey::new("mem", Labels::new());
        let samples = series((0..60).map(|i| if i % 2 == 0 { 110.0 } else { 100.0 + i as f64 * 0.01 }));

        let score = detector.score(&key, 0.0, &ctx(samples)).await.unwrap();
        assert!(!score.is_anomaly);
    }

    #[test]
    fn test_limit_projection() {
        let detector = TrendDetector::new(0.0).with_limit(200.0);
        // +1 per minute from 100
        let trend = detector
            .analyze(&series((0..60).map(|i| 100.0 + i as f64)))
            .unwrap();

        let secs = trend.seconds_to_limit.unwrap();
        // 41 units remaining at 1/60 per second
        assert!((secs - 41.0 * 60.0).abs() < 1.0, "secs {}", secs);
        assert!((trend.rate_per_hour() - 60.0).abs() < 1e-6);
    }

    #[test]
    fn test_insufficient_samples() {
        let detector = TrendDetector::default();
        let result = detector.analyze(&series((0..5).map(|i| i as f64)));
        assert!(matches!(result, Err(DetectorError::InsufficientData { .. })));
    }
}

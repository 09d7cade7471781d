//! Window statistics for dynamic baselines

use crate::ingest::SeriesWindow;
use chrono::{DateTime, Timelike, Utc};

/// Summary statistics over a window of values
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowStats {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (Bessel's correction)
    pub std_dev: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
}

impl WindowStats {
    /// Compute statistics with a two-pass variance for stability.
    /// Returns `None` for an empty slice.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;

        let std_dev = if count > 1 {
            let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
                / (count - 1) as f64;
            variance.sqrt()
        } else {
            0.0
        };

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };

        Some(Self {
            count,
            mean,
            std_dev,
            median,
            min: sorted[0],
            max: sorted[count - 1],
        })
    }

    pub fn from_window(window: &SeriesWindow) -> Option<Self> {
        Self::from_values(&window.values())
    }

    /// Distance from the mean in standard deviations
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std_dev < f64::EPSILON {
            return None;
        }
        Some((value - self.mean) / self.std_dev)
    }
}

/// Ratio of the same-hour-of-day mean to the overall mean of `history`.
///
/// Falls back to 1.0 when the bucket has fewer than `min_samples` values or
/// the overall mean is zero.
pub fn seasonal_factor(history: &SeriesWindow, now: DateTime<Utc>, min_samples: usize) -> f64 {
    let hour = now.hour();
    let bucket: Vec<f64> = history
        .iter()
        .filter(|s| s.timestamp.hour() == hour)
        .map(|s| s.value)
        .collect();

    if bucket.len() < min_samples {
        return 1.0;
    }

    let overall = match WindowStats::from_window(history) {
        Some(stats) if stats.mean.abs() > f64::EPSILON => stats.mean,
        _ => return 1.0,
    };
    let bucket_mean = bucket.iter().sum::<f64>() / bucket.len() as f64;
    bucket_mean / overall
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{Sample, SeriesKey};
    use crate::models::Labels;
    use chrono::{Duration, TimeZone};

    #[test]
    fn test_stats_calculation() {
        let values: Vec<f64> = (1..=20).map(|i| i as f64).collect();
        let stats = WindowStats::from_values(&values).unwrap();

        assert_eq!(stats.count, 20);
        assert!((stats.mean - 10.5).abs() < 1e-9);
        assert!((stats.median - 10.5).abs() < 1e-9);
        assert!((stats.std_dev - 5.916).abs() < 0.001);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 20.0);
    }

    #[test]
    fn test_single_value_has_zero_std_dev() {
        let stats = WindowStats::from_values(&[4.0]).unwrap();
        assert_eq!(stats.std_dev, 0.0);
        assert!(stats.z_score(10.0).is_none());
        assert!(WindowStats::from_values(&[]).is_none());
    }

    #[test]
    fn test_seasonal_factor_uses_same_hour_bucket() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        // Two days of 10-minute samples; 14:00-14:59 runs at double load
        let samples: Vec<Sample> = (0..288)
            .map(|i| {
                let ts = start + Duration::minutes(i * 10);
                let value = if ts.hour() == 14 { 200.0 } else { 100.0 };
                Sample {
                    timestamp: ts,
                    value,
                }
            })
            .collect();
        let history = SeriesWindow {
            key: SeriesKey::new("rps", Labels::new()),
            samples,
        };

        let at_peak = Utc.with_ymd_and_hms(2024, 1, 3, 14, 30, 0).unwrap();
        let factor = seasonal_factor(&history, at_peak, 10);
        assert!(factor > 1.8 && factor < 2.0, "factor {}", factor);

        let off_peak = Utc.with_ymd_and_hms(2024, 1, 3, 3, 0, 0).unwrap();
        assert!(seasonal_factor(&history, off_peak, 10) < 1.0);

        // Not enough samples in the bucket
        assert_eq!(seasonal_factor(&history, at_peak, 100), 1.0);
    }
}

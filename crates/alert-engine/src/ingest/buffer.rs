//! Per-series ring buffer for incoming metric samples
//!
//! - Bounded ring per (metric, labels) series, oldest entries overwritten
//! - Retention-based eviction relative to the newest sample
//! - Consistent window snapshots for concurrent readers

use crate::models::{Labels, MetricSample};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Default retention period (24 hours)
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default samples kept per series (24 hours at one sample per minute)
const DEFAULT_CAPACITY_PER_SERIES: usize = 1440;

/// Default cap on distinct series
const DEFAULT_MAX_SERIES: usize = 100_000;

/// Configuration for the ingest buffer
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Maximum samples per series before the oldest is overwritten
    pub capacity_per_series: usize,
    /// Samples older than this relative to the newest sample are evicted
    pub retention: Duration,
    /// Samples for new series beyond this cap are dropped
    pub max_series: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity_per_series: DEFAULT_CAPACITY_PER_SERIES,
            retention: DEFAULT_RETENTION,
            max_series: DEFAULT_MAX_SERIES,
        }
    }
}

/// Identity of a time series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub metric: String,
    pub labels: Labels,
}

impl SeriesKey {
    pub fn new(metric: impl Into<String>, labels: Labels) -> Self {
        Self {
            metric: metric.into(),
            labels,
        }
    }

    /// True if every matcher label is present with the same value
    pub fn matches(&self, metric: &str, matchers: &Labels) -> bool {
        self.metric == metric
            && matchers
                .iter()
                .all(|(k, v)| self.labels.get(k).map(|have| have == v).unwrap_or(false))
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{{", self.metric)?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", k, v)?;
        }
        write!(f, "}}")
    }
}

/// A single timestamped value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Immutable snapshot of a series over a time window.
///
/// Iterating it any number of times yields the same samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesWindow {
    pub key: SeriesKey,
    pub samples: Vec<Sample>,
}

impl SeriesWindow {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> + '_ {
        self.samples.iter()
    }

    pub fn values(&self) -> Vec<f64> {
        self.samples.iter().map(|s| s.value).collect()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.samples.last().copied()
    }
}

/// Time-ordered ring for one series
#[derive(Debug)]
struct SeriesRing {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SeriesRing {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    fn insert(&mut self, sample: Sample, retention: chrono::Duration) {
        match self.samples.back() {
            Some(last) if sample.timestamp < last.timestamp => {
                let pos = self
                    .samples
                    .partition_point(|s| s.timestamp <= sample.timestamp);
                self.samples.insert(pos, sample);
            }
            _ => self.samples.push_back(sample),
        }

        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }

        self.evict_expired(retention);
    }

    fn evict_expired(&mut self, retention: chrono::Duration) {
        let Some(newest) = self.samples.back().map(|s| s.timestamp) else {
            return;
        };
        let cutoff = newest - retention;
        while let Some(front) = self.samples.front() {
            if front.timestamp < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn newest(&self) -> Option<DateTime<Utc>> {
        self.samples.back().map(|s| s.timestamp)
    }
}

/// Concurrent, bounded store of recent samples keyed by series
pub struct IngestBuffer {
    series: DashMap<SeriesKey, SeriesRing>,
    config: BufferConfig,
    retention: chrono::Duration,
    accepted: AtomicU64,
    dropped: AtomicU64,
}

impl Default for IngestBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}

impl IngestBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let retention = crate::models::chrono_duration(config.retention);
        Self {
            series: DashMap::new(),
            config,
            retention,
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a sample to its series. Never fails for the producer:
    /// non-finite values and samples over the series cap are counted and dropped.
    pub fn ingest(&self, sample: MetricSample) -> bool {
        if !sample.value.is_finite() || sample.metric.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let key = SeriesKey::new(sample.metric, sample.labels);
        if !self.series.contains_key(&key) && self.series.len() >= self.config.max_series {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(series = %key, "Series cap reached, dropping sample");
            return false;
        }

        let point = Sample {
            timestamp: sample.timestamp,
            value: sample.value,
        };
        self.series
            .entry(key)
            .or_insert_with(|| SeriesRing::new(self.config.capacity_per_series))
            .insert(point, self.retention);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Append a batch, returning how many samples were accepted
    pub fn ingest_batch(&self, samples: impl IntoIterator<Item = MetricSample>) -> usize {
        samples
            .into_iter()
            .map(|s| self.ingest(s))
            .filter(|accepted| *accepted)
            .count()
    }

    /// Snapshot of samples in `[now - duration, now]`
    pub fn window(&self, key: &SeriesKey, duration: Duration, now: DateTime<Utc>) -> SeriesWindow {
        let start = now - crate::models::chrono_duration(duration);
        let samples = self
            .series
            .get(key)
            .map(|ring| {
                ring.samples
                    .iter()
                    .filter(|s| s.timestamp >= start && s.timestamp <= now)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();

        SeriesWindow {
            key: key.clone(),
            samples,
        }
    }

    /// Snapshot of every retained sample of a series
    pub fn history(&self, key: &SeriesKey) -> SeriesWindow {
        let samples = self
            .series
            .get(key)
            .map(|ring| ring.samples.iter().copied().collect())
            .unwrap_or_default();
        SeriesWindow {
            key: key.clone(),
            samples,
        }
    }

    /// Most recent sample of a series
    pub fn latest(&self, key: &SeriesKey) -> Option<Sample> {
        self.series.get(key).and_then(|ring| ring.samples.back().copied())
    }

    /// Series of `metric` carrying all `matchers`
    pub fn select(&self, metric: &str, matchers: &Labels) -> Vec<SeriesKey> {
        let mut keys: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|entry| entry.key().matches(metric, matchers))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Series sharing the value of at least one of `label_names` with `labels`
    pub fn correlated(&self, labels: &Labels, label_names: &[String]) -> Vec<SeriesKey> {
        let wanted: Vec<(&String, &String)> = label_names
            .iter()
            .filter_map(|name| labels.get_key_value(name))
            .collect();
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut keys: Vec<SeriesKey> = self
            .series
            .iter()
            .filter(|entry| {
                wanted
                    .iter()
                    .any(|(k, v)| entry.key().labels.get(*k) == Some(*v))
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    /// Drop series whose newest sample is older than retention. Returns the count removed.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let before = self.series.len();
        self.series
            .retain(|_, ring| ring.newest().map(|ts| ts >= cutoff).unwrap_or(false));
        before.saturating_sub(self.series.len())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn stats(&self) -> BufferStats {
        let samples = self.series.iter().map(|entry| entry.samples.len()).sum();
        BufferStats {
            series: self.series.len(),
            samples,
            accepted_total: self.accepted.load(Ordering::Relaxed),
            dropped_total: self.dropped.load(Ordering::Relaxed),
            capacity_per_series: self.config.capacity_per_series,
            retention_seconds: self.config.retention.as_secs(),
        }
    }
}

/// Buffer statistics
#[derive(Debug, Clone, Serialize)]
pub struct BufferStats {
    pub series: usize,
    pub samples: usize,
    pub accepted_total: u64,
    pub dropped_total: u64,
    pub capacity_per_series: usize,
    pub retention_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample(metric: &str, host: &str, value: f64, secs: i64) -> MetricSample {
        MetricSample::new(metric, labels(&[("host", host)]), value, t(secs))
    }

    #[test]
    fn test_ring_overwrites_oldest_when_full() {
        let buffer = IngestBuffer::new(BufferConfig {
            capacity_per_series: 5,
            ..Default::default()
        });

        for i in 0..8 {
            assert!(buffer.ingest(sample("cpu", "web-01", i as f64, i)));
        }

        let key = SeriesKey::new("cpu", labels(&[("host", "web-01")]));
        let history = buffer.history(&key);
        assert_eq!(history.len(), 5);
        assert_eq!(history.values(), vec![3.0, 4.0, 5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_out_of_order_samples_are_time_ordered() {
        let buffer = IngestBuffer::default();
        buffer.ingest(sample("cpu", "web-01", 1.0, 10));
        buffer.ingest(sample("cpu", "web-01", 3.0, 30));
        buffer.ingest(sample("cpu", "web-01", 2.0, 20));

        let key = SeriesKey::new("cpu", labels(&[("host", "web-01")]));
        assert_eq!(buffer.history(&key).values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(buffer.latest(&key).map(|s| s.value), Some(3.0));
    }

    #[test]
    fn test_retention_evicts_relative_to_newest() {
        let buffer = IngestBuffer::new(BufferConfig {
            retention: Duration::from_secs(60),
            ..Default::default()
        });
        for i in 0..10 {
            buffer.ingest(sample("cpu", "web-01", i as f64, i * 20));
        }

        let key = SeriesKey::new("cpu", labels(&[("host", "web-01")]));
        let history = buffer.history(&key);
        // newest at 180s, cutoff 120s
        assert_eq!(history.values(), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_window_is_bounded_and_restartable() {
        let buffer = IngestBuffer::default();
        for i in 0..10 {
            buffer.ingest(sample("cpu", "web-01", i as f64, i * 60));
        }

        let key = SeriesKey::new("cpu", labels(&[("host", "web-01")]));
        let window = buffer.window(&key, Duration::from_secs(180), t(540));
        let first: Vec<f64> = window.iter().map(|s| s.value).collect();
        let second: Vec<f64> = window.iter().map(|s| s.value).collect();
        assert_eq!(first, vec![6.0, 7.0, 8.0, 9.0]);
        assert_eq!(first, second);

        // Later writes do not change an existing snapshot
        buffer.ingest(sample("cpu", "web-01", 99.0, 600));
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_non_finite_and_over_cap_samples_dropped() {
        let buffer = IngestBuffer::new(BufferConfig {
            max_series: 1,
            ..Default::default()
        });

        assert!(!buffer.ingest(sample("cpu", "web-01", f64::NAN, 0)));
        assert!(buffer.ingest(sample("cpu", "web-01", 1.0, 0)));
        assert!(!buffer.ingest(sample("cpu", "web-02", 1.0, 0)));
        // Existing series still accepts samples at the cap
        assert!(buffer.ingest(sample("cpu", "web-01", 2.0, 1)));

        let stats = buffer.stats();
        assert_eq!(stats.series, 1);
        assert_eq!(stats.samples, 2);
        assert_eq!(stats.dropped_total, 2);
    }

    #[test]
    fn test_select_and_correlated() {
        let buffer = IngestBuffer::default();
        buffer.ingest(sample("cpu", "web-01", 1.0, 0));
        buffer.ingest(sample("cpu", "web-02", 1.0, 0));
        buffer.ingest(sample("mem", "web-01", 1.0, 0));
        buffer.ingest(MetricSample::new(
            "disk",
            labels(&[("host", "db-01")]),
            1.0,
            t(0),
        ));

        assert_eq!(buffer.select("cpu", &Labels::new()).len(), 2);
        assert_eq!(buffer.select("cpu", &labels(&[("host", "web-02")])).len(), 1);
        assert!(buffer.select("cpu", &labels(&[("dc", "eu")])).is_empty());

        let related = buffer.correlated(&labels(&[("host", "web-01")]), &["host".to_string()]);
        let metrics: Vec<&str> = related.iter().map(|k| k.metric.as_str()).collect();
        assert_eq!(metrics, vec!["cpu", "mem"]);
    }

    #[test]
    fn test_prune_drops_stale_series() {
        let buffer = IngestBuffer::new(BufferConfig {
            retention: Duration::from_secs(300),
            ..Default::default()
        });
        buffer.ingest(sample("cpu", "web-01", 1.0, 0));
        buffer.ingest(sample("cpu", "web-02", 1.0, 500));

        assert_eq!(buffer.prune(t(600)), 1);
        assert_eq!(buffer.series_count(), 1);
    }

    #[test]
    fn test_series_key_display() {
        let key = SeriesKey::new("cpu", labels(&[("host", "web-01"), ("dc", "eu")]));
        assert_eq!(key.to_string(), "cpu{dc=\"eu\",host=\"web-01\"}");
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_tear_reads() {
        let buffer = Arc::new(IngestBuffer::default());
        let key = SeriesKey::new("cpu", labels(&[("host", "web-01")]));

        let mut handles = Vec::new();
        for w in 0..4 {
            let buffer = buffer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..200 {
                    buffer.ingest(sample("cpu", "web-01", 1.0, w * 1000 + i));
                }
            }));
        }

        for _ in 0..50 {
            let snapshot = buffer.history(&key);
            assert!(snapshot
                .samples
                .windows(2)
                .all(|w| w[0].timestamp <= w[1].timestamp));
            tokio::task::yield_now().await;
        }

        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(buffer.history(&key).len(), 800);
    }
}

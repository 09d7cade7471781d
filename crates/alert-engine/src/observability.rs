//! Observability infrastructure for the alerting engine
//!
//! Provides:
//! - Prometheus metrics (ingest volume, evaluation latency, alert states,
//!   notification outcomes, AI analysis calls)
//! - Structured JSON logging of lifecycle events with tracing

use crate::models::{Alert, AlertEventKind, AnalysisStatus};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    samples_ingested: IntCounter,
    samples_dropped: IntCounter,
    active_series: IntGauge,
    evaluation_latency_seconds: Histogram,
    evaluations: IntCounterVec,
    alerts_by_status: IntGaugeVec,
    alert_transitions: IntCounterVec,
    notifications: IntCounterVec,
    notification_retries: IntCounter,
    ai_calls: IntCounterVec,
    ai_cache_hits: IntCounter,
    analysis_latency_seconds: Histogram,
    rules_loaded: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            samples_ingested: register_int_counter!(
                "alert_engine_samples_ingested_total",
                "Metric samples accepted into the ingest buffer"
            )
            .expect("Failed to register samples_ingested_total"),

            samples_dropped: register_int_counter!(
                "alert_engine_samples_dropped_total",
                "Metric samples dropped (non-finite values or series cap)"
            )
            .expect("Failed to register samples_dropped_total"),

            active_series: register_int_gauge!(
                "alert_engine_active_series",
                "Number of series currently held in the ingest buffer"
            )
            .expect("Failed to register active_series"),

            evaluation_latency_seconds: register_histogram!(
                "alert_engine_evaluation_latency_seconds",
                "Time spent evaluating one rule",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register evaluation_latency_seconds"),

            evaluations: register_int_counter_vec!(
                "alert_engine_group_evaluations_total",
                "Rule group evaluations by outcome",
                &["outcome"]
            )
            .expect("Failed to register group_evaluations_total"),

            alerts_by_status: register_int_gauge_vec!(
                "alert_engine_alerts",
                "Alerts currently known by status",
                &["status"]
            )
            .expect("Failed to register alerts"),

            alert_transitions: register_int_counter_vec!(
                "alert_engine_alert_transitions_total",
                "Alert lifecycle transitions by kind",
                &["kind"]
            )
            .expect("Failed to register alert_transitions_total"),

            notifications: register_int_counter_vec!(
                "alert_engine_notifications_total",
                "Notification deliveries by channel and outcome",
                &["channel", "outcome"]
            )
            .expect("Failed to register notifications_total"),

            notification_retries: register_int_counter!(
                "alert_engine_notification_retries_total",
                "Notification attempts retried after a retryable failure"
            )
            .expect("Failed to register notification_retries_total"),

            ai_calls: register_int_counter_vec!(
                "alert_engine_ai_calls_total",
                "Calls to the AI analysis provider by outcome",
                &["outcome"]
            )
            .expect("Failed to register ai_calls_total"),

            ai_cache_hits: register_int_counter!(
                "alert_engine_ai_cache_hits_total",
                "Root-cause analyses served from the cache"
            )
            .expect("Failed to register ai_cache_hits_total"),

            analysis_latency_seconds: register_histogram!(
                "alert_engine_analysis_latency_seconds",
                "Time spent producing a root-cause analysis",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register analysis_latency_seconds"),

            rules_loaded: register_int_gauge!(
                "alert_engine_rules_loaded",
                "Number of alert rules in the active snapshot"
            )
            .expect("Failed to register rules_loaded"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn record_ingest(&self, accepted: u64, dropped: u64) {
        self.inner().samples_ingested.inc_by(accepted);
        self.inner().samples_dropped.inc_by(dropped);
    }

    pub fn set_active_series(&self, count: i64) {
        self.inner().active_series.set(count);
    }

    pub fn observe_evaluation_latency(&self, duration_secs: f64) {
        self.inner().evaluation_latency_seconds.observe(duration_secs);
    }

    /// `outcome` is one of `conclusive` or `inconclusive`
    pub fn inc_group_evaluations(&self, outcome: &str, count: u64) {
        self.inner()
            .evaluations
            .with_label_values(&[outcome])
            .inc_by(count);
    }

    pub fn set_alerts_by_status(&self, status: &str, count: i64) {
        self.inner()
            .alerts_by_status
            .with_label_values(&[status])
            .set(count);
    }

    pub fn inc_alert_transition(&self, kind: AlertEventKind) {
        self.inner()
            .alert_transitions
            .with_label_values(&[&kind.to_string()])
            .inc();
    }

    /// `outcome` is one of `delivered`, `failed`, `suppressed` or `folded`
    pub fn inc_notification(&self, channel: &str, outcome: &str) {
        self.inner()
            .notifications
            .with_label_values(&[channel, outcome])
            .inc();
    }

    pub fn inc_notification_retry(&self) {
        self.inner().notification_retries.inc();
    }

    /// `outcome` is one of `success` or `failure`
    pub fn inc_ai_call(&self, outcome: &str) {
        self.inner().ai_calls.with_label_values(&[outcome]).inc();
    }

    pub fn inc_ai_cache_hit(&self) {
        self.inner().ai_cache_hits.inc();
    }

    pub fn observe_analysis_latency(&self, duration_secs: f64) {
        self.inner().analysis_latency_seconds.observe(duration_secs);
    }

    pub fn set_rules_loaded(&self, count: i64) {
        self.inner().rules_loaded.set(count);
    }
}

/// Structured logger for engine events
///
/// Provides consistent JSON-formatted logging for alert transitions,
/// notification outcomes, analyses and rule reloads.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_alert_transition(&self, alert: &Alert, kind: AlertEventKind) {
        let labels = format!("{:?}", alert.labels);
        match kind {
            AlertEventKind::Firing | AlertEventKind::Reopened => {
                warn!(
                    event = "alert_transition",
                    node = %self.node_name,
                    transition = %kind,
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    fingerprint = %alert.fingerprint,
                    severity = %alert.severity,
                    status = %alert.status,
                    value = alert.value,
                    reopen_count = alert.reopen_count,
                    labels = %labels,
                    "Alert firing"
                );
            }
            _ => {
                info!(
                    event = "alert_transition",
                    node = %self.node_name,
                    transition = %kind,
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    fingerprint = %alert.fingerprint,
                    severity = %alert.severity,
                    status = %alert.status,
                    labels = %labels,
                    "Alert state changed"
                );
            }
        }
    }

    pub fn log_notification(
        &self,
        alert_id: &str,
        channel: &str,
        step: usize,
        outcome: &str,
        attempts: u32,
        error: Option<&str>,
    ) {
        match error {
            Some(error) => warn!(
                event = "notification",
                node = %self.node_name,
                alert_id = %alert_id,
                channel = %channel,
                step = step,
                outcome = %outcome,
                attempts = attempts,
                error = %error,
                "Notification delivery failed"
            ),
            None => info!(
                event = "notification",
                node = %self.node_name,
                alert_id = %alert_id,
                channel = %channel,
                step = step,
                outcome = %outcome,
                attempts = attempts,
                "Notification processed"
            ),
        }
    }

    pub fn log_analysis(
        &self,
        alert_id: &str,
        status: AnalysisStatus,
        confidence: f64,
        cached: bool,
        reason: Option<&str>,
    ) {
        if status == AnalysisStatus::Unavailable {
            warn!(
                event = "analysis",
                node = %self.node_name,
                alert_id = %alert_id,
                status = %status,
                reason = reason.unwrap_or("unknown"),
                "Root-cause analysis unavailable"
            );
        } else {
            info!(
                event = "analysis",
                node = %self.node_name,
                alert_id = %alert_id,
                status = %status,
                confidence = confidence,
                cached = cached,
                "Root-cause analysis completed"
            );
        }
    }

    pub fn log_inconclusive(&self, rule_id: &str, fingerprint: &str, reason: &str) {
        debug!(
            event = "evaluation_inconclusive",
            node = %self.node_name,
            rule_id = %rule_id,
            fingerprint = %fingerprint,
            reason = %reason,
            "Evaluation inconclusive, state unchanged"
        );
    }

    pub fn log_rules_reloaded(&self, source: &str, count: usize, error: Option<&str>) {
        match error {
            None => info!(
                event = "rules_reloaded",
                node = %self.node_name,
                source = %source,
                rules = count,
                "Alert rules reloaded"
            ),
            Some(error) => warn!(
                event = "rules_reload_failed",
                node = %self.node_name,
                source = %source,
                error = %error,
                "Alert rule reload rejected"
            ),
        }
    }

    pub fn log_startup(&self, version: &str, rules: usize, channels: usize) {
        info!(
            event = "engine_started",
            node = %self.node_name,
            version = %version,
            rules = rules,
            channels = channels,
            "Alert engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Alert engine shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_metrics_creation() {
        let metrics = EngineMetrics::new();
        let clone = metrics.clone();

        metrics.record_ingest(10, 1);
        metrics.set_active_series(4);
        metrics.observe_evaluation_latency(0.002);
        metrics.inc_group_evaluations("conclusive", 3);
        metrics.set_alerts_by_status("firing", 2);
        metrics.inc_alert_transition(AlertEventKind::Firing);
        clone.inc_notification("ops-webhook", "delivered");
        clone.inc_ai_call("success");
        clone.inc_ai_cache_hit();
        clone.set_rules_loaded(5);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "alert_engine_samples_ingested_total"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}

//! Core data models for the alerting engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Label set attached to a series, rule group or alert.
///
/// Ordered so that fingerprints and series keys are stable.
pub type Labels = BTreeMap<String, String>;

/// A single metric observation from a collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric: String,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(metric: impl Into<String>, labels: Labels, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric: metric.into(),
            labels,
            value,
            timestamp,
        }
    }
}

/// Alert severity levels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Lifecycle status of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Pending,
    Firing,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// Every status except `Resolved` counts as active for a fingerprint
    pub fn is_active(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }

    /// Firing or acknowledged: the condition was confirmed
    pub fn is_confirmed(&self) -> bool {
        matches!(self, AlertStatus::Firing | AlertStatus::Acknowledged)
    }
}

impl std::fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertStatus::Pending => write!(f, "pending"),
            AlertStatus::Firing => write!(f, "firing"),
            AlertStatus::Acknowledged => write!(f, "acknowledged"),
            AlertStatus::Resolved => write!(f, "resolved"),
        }
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(AlertStatus::Pending),
            "firing" => Ok(AlertStatus::Firing),
            "acknowledged" | "ack" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(format!("unknown alert status '{}'", other)),
        }
    }
}

/// Threshold values in effect for one evaluation of one series
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upper: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lower: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub baseline: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_dev: Option<f64>,
    /// Anomaly score, only set for AI thresholds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    pub confidence: f64,
}

/// Transient output of one evaluation cycle for a (rule, group)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawAlertSignal {
    pub rule_id: String,
    pub rule_name: String,
    pub fingerprint: String,
    pub group_labels: Labels,
    /// Static labels of the rule, copied onto the alert
    #[serde(default)]
    pub rule_labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub severity: Severity,
    pub value: f64,
    pub threshold: Threshold,
    pub triggered_at: DateTime<Utc>,
}

/// Notice that a (rule, group) condition stopped holding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clearance {
    pub rule_id: String,
    pub fingerprint: String,
    pub group_labels: Labels,
    pub cleared_at: DateTime<Utc>,
}

/// Persistent alert record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub fingerprint: String,
    pub status: AlertStatus,
    pub severity: Severity,
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Last observed value of the breaching condition
    pub value: f64,
    pub threshold: Threshold,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_since: Option<DateTime<Utc>>,
    /// Set when the alert starts firing and never moved afterwards
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default)]
    pub reopen_count: u32,
    /// Previous incident this alert continues, when reopened as a new alert
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
}

/// A ranked root-cause candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateCause {
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
}

/// Outcome of a root-cause analysis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    NoCauseFound,
    Unavailable,
}

impl std::fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnalysisStatus::Completed => write!(f, "completed"),
            AnalysisStatus::NoCauseFound => write!(f, "no_cause_found"),
            AnalysisStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// AI-assisted root-cause analysis attached to an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCauseAnalysis {
    pub alert_id: String,
    pub fingerprint: String,
    pub context_hash: String,
    pub status: AnalysisStatus,
    pub causes: Vec<CandidateCause>,
    pub evidence: Vec<String>,
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub knowledge_refs: Vec<String>,
    pub confidence: f64,
    pub model: String,
    pub unavailable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unavailable_reason: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl RootCauseAnalysis {
    /// Degraded result returned when the AI capability could not be reached
    pub fn unavailable(
        alert: &Alert,
        context_hash: impl Into<String>,
        model: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            alert_id: alert.id.clone(),
            fingerprint: alert.fingerprint.clone(),
            context_hash: context_hash.into(),
            status: AnalysisStatus::Unavailable,
            causes: Vec::new(),
            evidence: Vec::new(),
            recommendations: Vec::new(),
            knowledge_refs: Vec::new(),
            confidence: 0.0,
            model: model.into(),
            unavailable: true,
            unavailable_reason: Some(reason.into()),
            generated_at: Utc::now(),
        }
    }
}

/// Runbook or incident note used to ground analyses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub embedding: Vec<f32>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

/// Alert lifecycle event kinds published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertEventKind {
    Pending,
    Firing,
    Reopened,
    Updated,
    Acknowledged,
    Resolved,
    Cancelled,
    AnalysisReady,
}

impl std::fmt::Display for AlertEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertEventKind::Pending => "pending",
            AlertEventKind::Firing => "firing",
            AlertEventKind::Reopened => "reopened",
            AlertEventKind::Updated => "updated",
            AlertEventKind::Acknowledged => "acknowledged",
            AlertEventKind::Resolved => "resolved",
            AlertEventKind::Cancelled => "cancelled",
            AlertEventKind::AnalysisReady => "analysis_ready",
        };
        write!(f, "{}", s)
    }
}

/// Alert lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: Alert,
    pub at: DateTime<Utc>,
}

/// Convert a std duration into a chrono duration, saturating on overflow
pub(crate) fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

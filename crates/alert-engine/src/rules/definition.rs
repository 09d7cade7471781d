//! Alert rule definitions and validation

use crate::error::{EngineError, EngineResult};
use crate::models::{Labels, Severity, Threshold};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

const EQ_TOLERANCE: f64 = 1e-9;

/// Metric name plus equality label matchers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSelector {
    pub metric: String,
    #[serde(default)]
    pub matchers: Labels,
}

/// Comparison applied between a value and its threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
    /// Above the upper bound or below the lower bound
    Outside,
}

impl Operator {
    /// Compare `value` against bound-style thresholds.
    /// Returns `None` when the threshold lacks the bound this operator needs.
    pub fn compare(&self, value: f64, threshold: &Threshold) -> Option<bool> {
        match self {
            Operator::Gt => threshold.upper.map(|u| value > u),
            Operator::Gte => threshold.upper.map(|u| value >= u),
            Operator::Lt => threshold.lower.map(|l| value < l),
            Operator::Lte => threshold.lower.map(|l| value <= l),
            Operator::Eq => threshold.baseline.map(|b| (value - b).abs() <= EQ_TOLERANCE),
            Operator::Ne => threshold.baseline.map(|b| (value - b).abs() > EQ_TOLERANCE),
            Operator::Outside => match (threshold.upper, threshold.lower) {
                (Some(u), Some(l)) => Some(value > u || value < l),
                _ => None,
            },
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Outside => "outside",
        };
        write!(f, "{}", s)
    }
}

/// How the dynamic baseline is derived from the window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaselineMethod {
    #[default]
    Mean,
    Median,
    /// Mean scaled by the same-hour-of-day factor from retained history
    Seasonal,
}

/// Threshold definition for a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ThresholdSpec {
    Static {
        value: f64,
        /// Lower bound, only used by `outside`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lower: Option<f64>,
    },
    Dynamic {
        #[serde(default = "default_sensitivity")]
        sensitivity: f64,
        #[serde(default = "default_window_secs")]
        window_secs: u64,
        #[serde(default)]
        baseline: BaselineMethod,
        #[serde(default = "default_min_samples")]
        min_samples: usize,
    },
    Ai {
        #[serde(default = "default_min_score")]
        min_score: f64,
        #[serde(default = "default_min_confidence")]
        min_confidence: f64,
    },
}

fn default_sensitivity() -> f64 {
    3.0
}

fn default_window_secs() -> u64 {
    3600
}

pub(crate) fn default_min_samples() -> usize {
    10
}

fn default_min_score() -> f64 {
    0.5
}

fn default_min_confidence() -> f64 {
    0.5
}

impl ThresholdSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ThresholdSpec::Static { .. } => "static",
            ThresholdSpec::Dynamic { .. } => "dynamic",
            ThresholdSpec::Ai { .. } => "ai",
        }
    }
}

/// One condition of a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Defaults to the selector metric
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    pub operator: Operator,
    pub threshold: ThresholdSpec,
}

impl Condition {
    /// Decide whether `value` breaches this condition for an already computed threshold
    pub fn breached(&self, value: f64, threshold: &Threshold) -> Option<bool> {
        match (&self.threshold, threshold.score) {
            (
                ThresholdSpec::Ai {
                    min_score,
                    min_confidence,
                },
                Some(score),
            ) => Some(score >= *min_score && threshold.confidence >= *min_confidence),
            (ThresholdSpec::Ai { .. }, None) => None,
            _ => self.operator.compare(value, threshold),
        }
    }
}

/// How multiple conditions combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionLogic {
    #[default]
    And,
    Or,
}

/// Actions triggered when a rule fires
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleActions {
    /// Channel ids notified immediately
    #[serde(default)]
    pub notify: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_policy: Option<String>,
    #[serde(default = "default_true")]
    pub analyze: bool,
    #[serde(default = "default_true")]
    pub notify_resolved: bool,
}

impl Default for RuleActions {
    fn default() -> Self {
        Self {
            notify: Vec::new(),
            escalation_policy: None,
            analyze: true,
            notify_resolved: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    60
}

/// Externally authored alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub selector: MetricSelector,
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub logic: ConditionLogic,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub group_by: Vec<String>,
    /// How long a condition must hold before firing
    #[serde(default)]
    pub for_secs: u64,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub actions: RuleActions,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AlertRule {
    pub fn for_duration(&self) -> Duration {
        Duration::from_secs(self.for_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Metric a condition reads from
    pub fn condition_metric<'a>(&'a self, condition: &'a Condition) -> &'a str {
        condition.metric.as_deref().unwrap_or(&self.selector.metric)
    }

    /// Labels identifying a group within this rule
    pub fn group_labels(&self, series_labels: &Labels) -> Labels {
        self.group_by
            .iter()
            .filter_map(|name| {
                series_labels
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// Reject definitions that could never evaluate correctly
    pub fn validate(&self) -> EngineResult<()> {
        let invalid = |reason: String| Err(EngineError::invalid_rule(&self.id, reason));

        if self.id.trim().is_empty() {
            return invalid("rule id must not be empty".to_string());
        }
        if self.name.trim().is_empty() {
            return invalid("rule name must not be empty".to_string());
        }
        if self.selector.metric.trim().is_empty() {
            return invalid("selector metric must not be empty".to_string());
        }
        if self.conditions.is_empty() {
            return invalid("at least one condition is required".to_string());
        }
        if self.interval_secs == 0 {
            return invalid("interval_secs must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for label in &self.group_by {
            if !seen.insert(label) {
                return invalid(format!("duplicate group_by label '{}'", label));
            }
        }

        for (idx, condition) in self.conditions.iter().enumerate() {
            if let Some(metric) = &condition.metric {
                if metric.trim().is_empty() {
                    return invalid(format!("condition {} has an empty metric", idx));
                }
            }
            if let Err(reason) = validate_condition(condition) {
                return invalid(format!("condition {}: {}", idx, reason));
            }
        }

        Ok(())
    }
}

fn validate_condition(condition: &Condition) -> Result<(), String> {
    match &condition.threshold {
        ThresholdSpec::Static { value, lower } => {
            if !value.is_finite() {
                return Err("static threshold must be finite".to_string());
            }
            if condition.operator == Operator::Outside {
                match lower {
                    Some(l) if l.is_finite() && *l < *value => {}
                    _ => {
                        return Err(
                            "outside with a static threshold needs a finite lower bound below value"
                                .to_string(),
                        )
                    }
                }
            }
        }
        ThresholdSpec::Dynamic {
            sensitivity,
            window_secs,
            min_samples,
            ..
        } => {
            if matches!(condition.operator, Operator::Eq | Operator::Ne) {
                return Err(format!(
                    "operator {} is not meaningful for a dynamic threshold",
                    condition.operator
                ));
            }
            if !sensitivity.is_finite() || *sensitivity <= 0.0 {
                return Err("sensitivity must be a positive number".to_string());
            }
            if *window_secs == 0 {
                return Err("window_secs must be greater than zero".to_string());
            }
            if *min_samples < 2 {
                return Err("min_samples must be at least 2".to_string());
            }
        }
        ThresholdSpec::Ai {
            min_score,
            min_confidence,
        } => {
            if !matches!(condition.operator, Operator::Gt | Operator::Gte) {
                return Err("AI thresholds only support gt/gte on the anomaly score".to_string());
            }
            if !(0.0..=1.0).contains(min_score) || !(0.0..=1.0).contains(min_confidence) {
                return Err("min_score and min_confidence must be within [0, 1]".to_string());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// cpu_usage_percent > 80 for 5m grouped by host
    pub fn cpu_rule() -> AlertRule {
        AlertRule {
            id: "R1".to_string(),
            name: "HighCpu".to_string(),
            description: "CPU usage above 80%".to_string(),
            selector: MetricSelector {
                metric: "cpu_usage_percent".to_string(),
                matchers: Labels::new(),
            },
            conditions: vec![Condition {
                metric: None,
                operator: Operator::Gt,
                threshold: ThresholdSpec::Static {
                    value: 80.0,
                    lower: None,
                },
            }],
            logic: ConditionLogic::And,
            severity: Severity::Critical,
            group_by: vec!["host".to_string()],
            for_secs: 300,
            interval_secs: 60,
            actions: RuleActions::default(),
            enabled: true,
            labels: Labels::new(),
            annotations: BTreeMap::new(),
        }
    }
}

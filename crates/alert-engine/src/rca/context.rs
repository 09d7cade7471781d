//! Bounded context handed to the AI provider

use crate::ingest::{SeriesKey, SeriesWindow};
use crate::knowledge::ScoredEntry;
use crate::models::{Alert, Labels, Severity, Threshold};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cache key for an analysis: same rule, same group, same value bucket
pub fn context_hash(rule_id: &str, labels: &Labels, value: f64, bucket_width: f64) -> String {
    let bucket = if bucket_width.is_finite() && bucket_width > 0.0 && value.is_finite() {
        (value / bucket_width).floor() as i64
    } else {
        0
    };

    let mut hasher = Sha256::new();
    hasher.update(rule_id.as_bytes());
    for (name, value) in labels.iter().filter(|(name, _)| name.as_str() != "alertname") {
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([1u8]);
        hasher.update(value.as_bytes());
    }
    hasher.update(bucket.to_le_bytes());
    hex::encode(&hasher.finalize()[..8])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDigest {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: Severity,
    pub labels: Labels,
    pub value: f64,
    pub threshold: Threshold,
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDigest {
    pub metric: String,
    pub labels: Labels,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub latest: f64,
    /// Downsampled (unix seconds, value) points
    pub points: Vec<(i64, f64)>,
}

impl SeriesDigest {
    fn from_window(window: &SeriesWindow, max_points: usize) -> Option<Self> {
        let latest = window.latest()?;
        let values = window.values();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        let stride = window.len().div_ceil(max_points.max(1)).max(1);
        let points = window
            .iter()
            .step_by(stride)
            .map(|s| (s.timestamp.timestamp(), s.value))
            .collect();

        Some(Self {
            metric: window.key.metric.clone(),
            labels: window.key.labels.clone(),
            min,
            max,
            mean,
            latest: latest.value,
            points,
        })
    }

    fn halve(&mut self) {
        self.points = self.points.iter().step_by(2).copied().collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeSnippet {
    pub id: String,
    pub title: String,
    pub excerpt: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisContext {
    pub alert: AlertDigest,
    pub history: Vec<SeriesDigest>,
    pub correlated: Vec<SeriesDigest>,
    pub knowledge: Vec<KnowledgeSnippet>,
    /// Items were dropped or thinned to fit the budget
    pub truncated: bool,
}

impl AnalysisContext {
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(usize::MAX)
    }
}

#[derive(Debug, Clone)]
pub struct ContextBuilder {
    pub budget_bytes: usize,
    pub max_points: usize,
    pub snippet_chars: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            budget_bytes: 16 * 1024,
            max_points: 60,
            snippet_chars: 600,
        }
    }
}

impl ContextBuilder {
    pub fn build(
        &self,
        alert: &Alert,
        description: Option<String>,
        history: &[SeriesWindow],
        correlated: &[SeriesWindow],
        knowledge: &[ScoredEntry],
    ) -> AnalysisContext {
        let mut context = AnalysisContext {
            alert: AlertDigest {
                id: alert.id.clone(),
                rule_id: alert.rule_id.clone(),
                rule_name: alert.rule_name.clone(),
                severity: alert.severity,
                labels: alert.labels.clone(),
                value: alert.value,
                threshold: alert.threshold.clone(),
                starts_at: alert.starts_at,
                description,
            },
            history: history
                .iter()
                .filter_map(|w| SeriesDigest::from_window(w, self.max_points))
                .collect(),
            correlated: correlated
                .iter()
                .filter_map(|w| SeriesDigest::from_window(w, self.max_points))
                .collect(),
            knowledge: knowledge
                .iter()
                .map(|hit| KnowledgeSnippet {
                    id: hit.entry.id.clone(),
                    title: hit.entry.title.clone(),
                    excerpt: truncate_chars(&hit.entry.content, self.snippet_chars),
                    score: hit.score,
                })
                .collect(),
            truncated: false,
        };
        self.fit(&mut context);
        context
    }

    fn fit(&self, context: &mut AnalysisContext) {
        while context.encoded_len() > self.budget_bytes {
            context.truncated = true;
            if !shrink_once(context) {
                break;
            }
        }
    }
}

/// Shrink the lowest-priority item: correlated series, then knowledge,
/// then the alert's own history
fn shrink_once(context: &mut AnalysisContext) -> bool {
    if let Some(series) = context.correlated.iter_mut().find(|s| s.points.len() > 4) {
        series.halve();
        return true;
    }
    if context.correlated.pop().is_some() {
        return true;
    }
    if let Some(snippet) = context
        .knowledge
        .iter_mut()
        .find(|k| k.excerpt.chars().count() > 80)
    {
        snippet.excerpt = truncate_chars(&snippet.excerpt, snippet.excerpt.chars().count() / 2);
        return true;
    }
    if context.knowledge.pop().is_some() {
        return true;
    }
    if let Some(series) = context.history.iter_mut().find(|s| s.points.len() > 1) {
        series.halve();
        return true;
    }
    context.history.pop().is_some()
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max).collect();
    out.push('…');
    out
}

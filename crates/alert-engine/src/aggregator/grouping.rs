//! Presentation-level aggregation
//!
//! Groups confirmed alerts that share a label subset into a view-only
//! `AggregatedAlert`. Recomputed on every read; alert identity is untouched.

use crate::models::{Alert, Labels, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationRule {
    pub name: String,
    /// Labels the grouped alerts must share
    pub group_labels: Vec<String>,
    #[serde(default = "default_min_alerts")]
    pub min_alerts: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_min_alerts() -> usize {
    3
}

fn default_window_secs() -> u64 {
    300
}

impl AggregationRule {
    /// Shared label values of `alert`, if it carries every group label
    pub fn key_for(&self, alert: &Alert) -> Option<Labels> {
        self.group_labels
            .iter()
            .map(|name| {
                alert
                    .labels
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    fn in_window(&self, alert: &Alert, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::seconds(self.window_secs.min(i64::MAX as u64) as i64);
        alert
            .starts_at
            .map(|start| start <= now && now - start <= window)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedAlert {
    pub rule: String,
    pub labels: Labels,
    pub alert_ids: Vec<String>,
    pub rule_ids: Vec<String>,
    pub count: usize,
    pub severity: Severity,
    pub first_started: DateTime<Utc>,
    pub last_started: DateTime<Utc>,
}

impl AggregatedAlert {
    pub fn summary(&self) -> String {
        let labels: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        format!(
            "{} alerts sharing {} ({})",
            self.count,
            labels.join(","),
            self.rule
        )
    }
}

/// Compute every aggregation group that reaches its rule's minimum size
pub fn aggregate(rules: &[AggregationRule], alerts: &[Alert], now: DateTime<Utc>) -> Vec<AggregatedAlert> {
    let mut out = Vec::new();

    for rule in rules {
        let mut groups: BTreeMap<Labels, Vec<&Alert>> = BTreeMap::new();
        for alert in alerts
            .iter()
            .filter(|a| a.status.is_confirmed() && rule.in_window(a, now))
        {
            if let Some(key) = rule.key_for(alert) {
                groups.entry(key).or_default().push(alert);
            }
        }

        for (labels, mut members) in groups {
            if members.len() < rule.min_alerts.max(1) {
                continue;
            }
            members.sort_by(|a, b| a.starts_at.cmp(&b.starts_at).then_with(|| a.id.cmp(&b.id)));

            let mut rule_ids: Vec<String> = members.iter().map(|a| a.rule_id.clone()).collect();
            rule_ids.sort();
            rule_ids.dedup();

            let first_started = members
                .first()
                .and_then(|a| a.starts_at)
                .unwrap_or(now);
            let last_started = members.last().and_then(|a| a.starts_at).unwrap_or(now);

            out.push(AggregatedAlert {
                rule: rule.name.clone(),
                labels,
                count: members.len(),
                severity: members
                    .iter()
                    .map(|a| a.severity)
                    .max()
                    .unwrap_or_default(),
                alert_ids: members.iter().map(|a| a.id.clone()).collect(),
                rule_ids,
                first_started,
                last_started,
            });
        }
    }
    out
}

/// Aggregation group containing `alert`, if any
pub fn group_of<'a>(aggregated: &'a [AggregatedAlert], alert: &Alert) -> Option<&'a AggregatedAlert> {
    aggregated
        .iter()
        .find(|group| group.alert_ids.iter().any(|id| id == &alert.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlertStatus, Threshold};
    use chrono::TimeZone;

    fn t(mins: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + mins * 60, 0).unwrap()
    }

    fn alert(id: &str, rule: &str, host: &str, dc: &str, started: i64) -> Alert {
        let mut labels = Labels::new();
        labels.insert("host".into(), host.into());
        labels.insert("dc".into(), dc.into());
        Alert {
            id: id.into(),
            rule_id: rule.into(),
            rule_name: rule.into(),
            fingerprint: format!("fp-{}", id),
            status: AlertStatus::Firing,
            severity: Severity::Warning,
            labels,
            annotations: Default::default(),
            value: 1.0,
            threshold: Threshold::default(),
            pending_since: None,
            starts_at: Some(t(started)),
            ends_at: None,
            updated_at: t(started),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            reopen_count: 0,
            related_to: None,
        }
    }

    fn by_dc() -> AggregationRule {
        AggregationRule {
            name: "datacenter-outage".into(),
            group_labels: vec!["dc".into()],
            min_alerts: 3,
            window_secs: 600,
        }
    }

    #[test]
    fn test_groups_reach_minimum() {
        let mut critical = alert("a3", "disk", "web-03", "eu", 3);
        critical.severity = Severity::Critical;
        let alerts = vec![
            alert("a1", "cpu", "web-01", "eu", 1),
            alert("a2", "cpu", "web-02", "eu", 2),
            critical,
            alert("b1", "cpu", "web-04", "us", 2),
        ];

        let groups = aggregate(&[by_dc()], &alerts, t(5));
        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.count, 3);
        assert_eq!(group.labels.get("dc").unwrap(), "eu");
        assert_eq!(group.severity, Severity::Critical);
        assert_eq!(group.rule_ids, vec!["cpu", "disk"]);
        assert_eq!(group.first_started, t(1));
        assert!(group.summary().contains("dc=eu"));

        assert!(group_of(&groups, &alerts[0]).is_some());
        assert!(group_of(&groups, &alerts[3]).is_none());
    }

    #[test]
    fn test_window_and_status_filter_members() {
        let mut resolved = alert("a3", "cpu", "web-03", "eu", 3);
        resolved.status = AlertStatus::Resolved;
        let alerts = vec![
            alert("a1", "cpu", "web-01", "eu", 1),
            alert("a2", "cpu", "web-02", "eu", 2),
            resolved,
            alert("old", "cpu", "web-05", "eu", -60),
        ];

        assert!(aggregate(&[by_dc()], &alerts, t(5)).is_empty());
    }

    #[test]
    fn test_alerts_missing_group_label_are_skipped() {
        let mut alerts: Vec<Alert> = (0..3)
            .map(|i| alert(&format!("a{}", i), "cpu", "web", "eu", i))
            .collect();
        alerts[0].labels.remove("dc");

        assert!(aggregate(&[by_dc()], &alerts, t(5)).is_empty());
    }
}

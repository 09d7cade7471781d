//! Rule evaluation
//!
//! Each rule splits its matching series into label groups. Every group runs
//! an `Inactive -> Pending -> Firing` state machine; an inconclusive cycle
//! (insufficient data, unknown condition) leaves the state untouched.

mod scheduler;
mod state;

pub use scheduler::{EvaluationScheduler, SchedulerConfig};
pub use state::{GroupPhase, GroupState};

use crate::aggregator::fingerprint;
use crate::ingest::{IngestBuffer, Sample, SeriesKey};
use crate::models::{
    chrono_duration, Alert, AlertStatus, Clearance, Labels, RawAlertSignal, Threshold,
};
use crate::rules::{AlertRule, Condition, ConditionLogic, RuleSet};
use crate::threshold::ThresholdCalculator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use state::{Step, Verdict};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Evaluator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluatorConfig {
    /// Series whose newest sample is older than this are ignored
    pub stale_after_secs: u64,
    /// Groups without fresh series for this long are dropped
    pub group_ttl_secs: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            group_ttl_secs: 900,
        }
    }
}

impl EvaluatorConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn group_ttl(&self) -> Duration {
        Duration::from_secs(self.group_ttl_secs)
    }
}

/// State change produced for one group in one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum GroupTransition {
    /// Condition became true; waiting out the for-duration
    Pending(RawAlertSignal),
    /// Condition held for the for-duration (emitted every cycle while true)
    Firing(RawAlertSignal),
    /// Condition stopped holding, or the group disappeared
    Cleared(Clearance),
}

impl GroupTransition {
    pub fn fingerprint(&self) -> &str {
        match self {
            GroupTransition::Pending(s) | GroupTransition::Firing(s) => &s.fingerprint,
            GroupTransition::Cleared(c) => &c.fingerprint,
        }
    }
}

/// Group left unchanged because a condition could not be decided
#[derive(Debug, Clone, PartialEq)]
pub struct InconclusiveGroup {
    pub fingerprint: String,
    pub labels: Labels,
    pub reason: String,
}

/// Result of evaluating one rule once
#[derive(Debug, Clone)]
pub struct EvaluationReport {
    pub rule_id: String,
    pub evaluated_at: DateTime<Utc>,
    pub groups_evaluated: usize,
    pub transitions: Vec<GroupTransition>,
    pub inconclusive: Vec<InconclusiveGroup>,
}

impl EvaluationReport {
    pub fn firing(&self) -> impl Iterator<Item = &RawAlertSignal> + '_ {
        self.transitions.iter().filter_map(|t| match t {
            GroupTransition::Firing(s) => Some(s),
            _ => None,
        })
    }
}

/// Fresh series of one group, keyed by metric name
#[derive(Default)]
struct GroupSeries {
    labels: Labels,
    series: BTreeMap<String, Vec<(SeriesKey, Sample)>>,
}

/// Breach of the deciding condition: the value and threshold to report
struct Breach {
    value: f64,
    threshold: Threshold,
}

enum ConditionOutcome {
    Breached(Breach),
    Clear,
    Unknown(String),
}

/// Evaluates rules against the ingest buffer and tracks group state
pub struct RuleEvaluator {
    buffer: Arc<IngestBuffer>,
    calculator: Arc<ThresholdCalculator>,
    config: EvaluatorConfig,
    states: DashMap<String, HashMap<String, GroupState>>,
}

impl RuleEvaluator {
    pub fn new(
        buffer: Arc<IngestBuffer>,
        calculator: Arc<ThresholdCalculator>,
        config: EvaluatorConfig,
    ) -> Self {
        Self {
            buffer,
            calculator,
            config,
            states: DashMap::new(),
        }
    }

    /// Evaluate every group of `rule` at `now`.
    ///
    /// Callers must not evaluate the same rule concurrently.
    pub async fn evaluate(&self, rule: &AlertRule, now: DateTime<Utc>) -> EvaluationReport {
        let mut states = self
            .states
            .remove(&rule.id)
            .map(|(_, states)| states)
            .unwrap_or_default();

        let groups = self.collect_groups(rule, now);
        let for_duration = chrono_duration(rule.for_duration());
        let mut report = EvaluationReport {
            rule_id: rule.id.clone(),
            evaluated_at: now,
            groups_evaluated: groups.len(),
            transitions: Vec::new(),
            inconclusive: Vec::new(),
        };

        for (fp, group) in &groups {
            let (verdict, breach) = self.decide(rule, group, now).await;
            let state = states
                .entry(fp.clone())
                .or_insert_with(|| GroupState::new(group.labels.clone(), now));

            if let Verdict::Inconclusive(reason) = &verdict {
                report.inconclusive.push(InconclusiveGroup {
                    fingerprint: fp.clone(),
                    labels: group.labels.clone(),
                    reason: reason.clone(),
                });
            }

            match state.advance(&verdict, for_duration, now) {
                Step::EnteredPending => {
                    if let Some(breach) = breach {
                        let signal = signal(rule, fp, &group.labels, breach, now);
                        report.transitions.push(GroupTransition::Pending(signal));
                    }
                }
                Step::Firing => {
                    if let Some(breach) = breach {
                        let signal = signal(rule, fp, &group.labels, breach, now);
                        report.transitions.push(GroupTransition::Firing(signal));
                    }
                }
                Step::Cleared => {
                    let clearance = clearance(rule, fp, &group.labels, now);
                    report.transitions.push(GroupTransition::Cleared(clearance));
                }
                Step::None => {}
            }
        }

        // Groups that produced no fresh series this cycle
        let ttl = chrono_duration(self.config.group_ttl());
        states.retain(|fp, state| {
            if groups.contains_key(fp) || now - state.last_seen < ttl {
                return true;
            }
            if state.phase.is_active() {
                report
                    .transitions
                    .push(GroupTransition::Cleared(clearance(rule, fp, &state.labels, now)));
            }
            false
        });

        if !states.is_empty() {
            self.states.insert(rule.id.clone(), states);
        }
        report
    }

    /// Drop state of rules that are no longer in `rules`, clearing their active groups
    pub fn forget_missing(&self, rules: &RuleSet, now: DateTime<Utc>) -> Vec<Clearance> {
        let missing: Vec<String> = self
            .states
            .iter()
            .filter(|entry| !rules.contains(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let mut cleared = Vec::new();
        for rule_id in missing {
            if let Some((_, states)) = self.states.remove(&rule_id) {
                cleared.extend(
                    states
                        .into_iter()
                        .filter(|(_, state)| state.phase.is_active())
                        .map(|(fp, state)| Clearance {
                            rule_id: rule_id.clone(),
                            fingerprint: fp,
                            group_labels: state.labels,
                            cleared_at: now,
                        }),
                );
            }
        }
        cleared
    }

    /// Resume group state for alerts that were active before a restart.
    ///
    /// Without it a restored alert whose condition has already cleared would
    /// never see a clearance. Groups that are already tracked are left alone.
    pub fn seed(&self, alerts: &[Alert], rules: &RuleSet, now: DateTime<Utc>) -> usize {
        let mut seeded = 0;
        for alert in alerts.iter().filter(|a| a.status.is_active()) {
            let phase = match alert.status {
                AlertStatus::Pending => GroupPhase::Pending {
                    since: alert.pending_since.unwrap_or(alert.updated_at),
                },
                _ => GroupPhase::Firing {
                    since: alert.starts_at.unwrap_or(alert.updated_at),
                },
            };
            let labels = match rules.get(&alert.rule_id) {
                Some(rule) => rule.group_labels(&alert.labels),
                None => alert.labels.clone(),
            };

            let mut states = self.states.entry(alert.rule_id.clone()).or_default();
            if !states.contains_key(&alert.fingerprint) {
                states.insert(
                    alert.fingerprint.clone(),
                    GroupState {
                        labels,
                        phase,
                        last_seen: now,
                    },
                );
                seeded += 1;
            }
        }
        seeded
    }

    /// Current phase of a group, if tracked
    pub fn group_phase(&self, rule_id: &str, fingerprint: &str) -> Option<GroupPhase> {
        self.states
            .get(rule_id)
            .and_then(|states| states.get(fingerprint).map(|s| s.phase))
    }

    pub fn tracked_groups(&self) -> usize {
        self.states.iter().map(|entry| entry.value().len()).sum()
    }

    /// Fresh series of every metric the rule reads, split into groups
    fn collect_groups(&self, rule: &AlertRule, now: DateTime<Utc>) -> BTreeMap<String, GroupSeries> {
        let mut metrics: Vec<&str> = rule
            .conditions
            .iter()
            .map(|c| rule.condition_metric(c))
            .collect();
        metrics.sort_unstable();
        metrics.dedup();

        let stale_after = self.config.stale_after();
        let mut groups: BTreeMap<String, GroupSeries> = BTreeMap::new();

        for metric in metrics {
            for key in self.buffer.select(metric, &rule.selector.matchers) {
                let Some(latest) = self.buffer.window(&key, stale_after, now).latest() else {
                    continue;
                };
                let labels = rule.group_labels(&key.labels);
                let fp = fingerprint(&rule.id, &labels);
                let group = groups.entry(fp).or_default();
                group.labels = labels;
                group
                    .series
                    .entry(metric.to_string())
                    .or_default()
                    .push((key, latest));
            }
        }
        groups
    }

    /// Combine every condition of a group into one verdict
    async fn decide(
        &self,
        rule: &AlertRule,
        group: &GroupSeries,
        now: DateTime<Utc>,
    ) -> (Verdict, Option<Breach>) {
        let mut breaches = Vec::with_capacity(rule.conditions.len());
        let mut any_clear = false;

        for condition in &rule.conditions {
            match self.check_condition(rule, condition, group, now).await {
                ConditionOutcome::Breached(breach) => breaches.push(breach),
                ConditionOutcome::Clear => any_clear = true,
                ConditionOutcome::Unknown(reason) => return (Verdict::Inconclusive(reason), None),
            }
        }

        let holds = match rule.logic {
            ConditionLogic::And => !any_clear,
            ConditionLogic::Or => !breaches.is_empty(),
        };
        if holds {
            (Verdict::True, breaches.into_iter().next())
        } else {
            (Verdict::False, None)
        }
    }

    async fn check_condition(
        &self,
        rule: &AlertRule,
        condition: &Condition,
        group: &GroupSeries,
        now: DateTime<Utc>,
    ) -> ConditionOutcome {
        let metric = rule.condition_metric(condition);
        let Some(series) = group.series.get(metric).filter(|s| !s.is_empty()) else {
            return ConditionOutcome::Unknown(format!("no fresh series for {}", metric));
        };

        let mut unknown = None;
        for (key, sample) in series {
            let threshold = match self
                .calculator
                .compute(key, &condition.threshold, *sample, now)
                .await
            {
                Ok(threshold) => threshold,
                Err(e) => {
                    unknown.get_or_insert_with(|| e.to_string());
                    continue;
                }
            };

            match condition.breached(sample.value, &threshold) {
                Some(true) => {
                    return ConditionOutcome::Breached(Breach {
                        value: sample.value,
                        threshold,
                    })
                }
                Some(false) => {}
                None => {
                    unknown.get_or_insert_with(|| {
                        format!("threshold for {} has no bound for {}", key, condition.operator)
                    });
                }
            }
        }

        match unknown {
            Some(reason) => ConditionOutcome::Unknown(reason),
            None => ConditionOutcome::Clear,
        }
    }
}

fn signal(
    rule: &AlertRule,
    fp: &str,
    labels: &Labels,
    breach: Breach,
    now: DateTime<Utc>,
) -> RawAlertSignal {
    RawAlertSignal {
        rule_id: rule.id.clone(),
        rule_name: rule.name.clone(),
        fingerprint: fp.to_string(),
        group_labels: labels.clone(),
        rule_labels: rule.labels.clone(),
        annotations: rule.annotations.clone(),
        severity: rule.severity,
        value: breach.value,
        threshold: breach.threshold,
        triggered_at: now,
    }
}

fn clearance(rule: &AlertRule, fp: &str, labels: &Labels, now: DateTime<Utc>) -> Clearance {
    Clearance {
        rule_id: rule.id.clone(),
        fingerprint: fp.to_string(),
        group_labels: labels.clone(),
        cleared_at: now,
    }
}

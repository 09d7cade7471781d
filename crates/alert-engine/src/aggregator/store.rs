//! Sharded alert store
//!
//! Every mutation for a fingerprint happens under that fingerprint's shard
//! lock, so admission, clearance and operator actions are linearizable per
//! fingerprint. A read view indexed by alert id serves queries without
//! taking shard locks.

use super::identity::shard_index;
use crate::error::{EngineError, EngineResult};
use crate::models::{
    chrono_duration, Alert, AlertEvent, AlertEventKind, AlertStatus, Clearance, RawAlertSignal,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

/// What happens when a resolved fingerprint fires again inside the grace window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReopenPolicy {
    /// Reuse the resolved alert's id and bump its reopen count
    #[default]
    ContinueIncident,
    /// Mint a new alert that links back to the resolved one
    LinkNew,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub shards: usize,
    pub reopen_grace_secs: u64,
    pub reopen_policy: ReopenPolicy,
    /// How long resolved alerts stay queryable
    pub resolved_retention_secs: u64,
    pub event_capacity: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            reopen_grace_secs: 600,
            reopen_policy: ReopenPolicy::ContinueIncident,
            resolved_retention_secs: 24 * 60 * 60,
            event_capacity: 1024,
        }
    }
}

impl AggregatorConfig {
    pub fn reopen_grace(&self) -> Duration {
        Duration::from_secs(self.reopen_grace_secs)
    }

    pub fn resolved_retention(&self) -> Duration {
        Duration::from_secs(self.resolved_retention_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    /// New alert for a fingerprint with no recent history
    Created,
    /// Pending alert confirmed by the for-duration
    Promoted,
    /// Resolved incident fired again inside the grace window
    Reopened,
    /// Already firing; value refreshed
    Updated,
    /// Stale or redundant signal
    Ignored,
}

#[derive(Debug, Clone)]
pub struct Admission {
    pub alert: Alert,
    pub outcome: AdmitOutcome,
}

impl Admission {
    /// True if the alert just started firing (new, promoted or reopened)
    pub fn started_firing(&self) -> bool {
        matches!(
            self.outcome,
            AdmitOutcome::Created | AdmitOutcome::Promoted | AdmitOutcome::Reopened
        ) && self.alert.status == AlertStatus::Firing
    }
}

#[derive(Debug, Clone)]
pub enum ClearOutcome {
    Resolved(Alert),
    /// A pending alert whose condition cleared before confirming; removed
    Cancelled(Alert),
    Ignored,
}

#[derive(Default)]
struct Shard {
    /// Non-resolved alert per fingerprint
    active: HashMap<String, Alert>,
    /// Most recently resolved alert per fingerprint, for reopen decisions
    last_resolved: HashMap<String, Alert>,
    /// Evaluation time of the newest signal or clearance per fingerprint.
    /// Operator actions never move it.
    signal_at: HashMap<String, DateTime<Utc>>,
}

impl Shard {
    fn is_stale(&self, fingerprint: &str, at: DateTime<Utc>) -> bool {
        self.signal_at
            .get(fingerprint)
            .map(|seen| at < *seen)
            .unwrap_or(false)
    }

    fn observe(&mut self, fingerprint: &str, at: DateTime<Utc>) {
        let seen = self.signal_at.entry(fingerprint.to_string()).or_insert(at);
        if at > *seen {
            *seen = at;
        }
    }
}

/// Alert store and deduplicator
pub struct AlertAggregator {
    shards: Vec<Mutex<Shard>>,
    view: DashMap<String, Alert>,
    events: broadcast::Sender<AlertEvent>,
    config: AggregatorConfig,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl AlertAggregator {
    pub fn new(config: AggregatorConfig, logger: StructuredLogger) -> Self {
        let shards = (0..config.shards.max(1))
            .map(|_| Mutex::new(Shard::default()))
            .collect();
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        Self {
            shards,
            view: DashMap::new(),
            events,
            config,
            logger,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    fn shard(&self, fingerprint: &str) -> &Mutex<Shard> {
        &self.shards[shard_index(fingerprint, self.shards.len())]
    }

    fn publish(&self, kind: AlertEventKind, alert: &Alert, at: DateTime<Utc>) {
        self.logger.log_alert_transition(alert, kind);
        self.metrics.inc_alert_transition(kind);
        // No subscribers is fine
        let _ = self.events.send(AlertEvent {
            kind,
            alert: alert.clone(),
            at,
        });
    }

    /// Record that a group's condition is true but not yet confirmed
    pub async fn admit_pending(&self, signal: &RawAlertSignal) -> Admission {
        let mut shard = self.shard(&signal.fingerprint).lock().await;
        let stale = shard.is_stale(&signal.fingerprint, signal.triggered_at);

        if let Some(existing) = shard.active.get(&signal.fingerprint) {
            if existing.status != AlertStatus::Pending || stale {
                return Admission {
                    alert: existing.clone(),
                    outcome: AdmitOutcome::Ignored,
                };
            }
            let mut alert = existing.clone();
            alert.value = signal.value;
            alert.threshold = signal.threshold.clone();
            alert.annotations = annotations_for(signal);
            alert.updated_at = signal.triggered_at;
            shard.observe(&signal.fingerprint, signal.triggered_at);
            shard.active.insert(signal.fingerprint.clone(), alert.clone());
            self.view.insert(alert.id.clone(), alert.clone());
            return Admission {
                alert,
                outcome: AdmitOutcome::Updated,
            };
        }

        shard.observe(&signal.fingerprint, signal.triggered_at);
        let mut alert = new_alert(signal, AlertStatus::Pending);
        alert.pending_since = Some(signal.triggered_at);
        shard.active.insert(signal.fingerprint.clone(), alert.clone());
        self.view.insert(alert.id.clone(), alert.clone());
        self.publish(AlertEventKind::Pending, &alert, signal.triggered_at);

        Admission {
            alert,
            outcome: AdmitOutcome::Created,
        }
    }

    /// Admit a firing signal. Idempotent per fingerprint: at most one
    /// non-resolved alert exists for a fingerprint at any time.
    pub async fn admit(&self, signal: &RawAlertSignal) -> Admission {
        let mut shard = self.shard(&signal.fingerprint).lock().await;
        let at = signal.triggered_at;
        let stale = shard.is_stale(&signal.fingerprint, at);

        if let Some(existing) = shard.active.get(&signal.fingerprint) {
            if stale {
                debug!(fingerprint = %signal.fingerprint, "Ignoring stale signal");
                return Admission {
                    alert: existing.clone(),
                    outcome: AdmitOutcome::Ignored,
                };
            }

            let existing = existing.clone();
            shard.observe(&signal.fingerprint, at);
            if existing.status == AlertStatus::Pending {
                return self.promote(&mut shard, existing, signal);
            }

            let mut alert = existing;
            alert.value = signal.value;
            alert.threshold = signal.threshold.clone();
            alert.severity = signal.severity;
            alert.annotations = annotations_for(signal);
            alert.updated_at = at;
            shard.active.insert(signal.fingerprint.clone(), alert.clone());
            self.view.insert(alert.id.clone(), alert.clone());
            self.publish(AlertEventKind::Updated, &alert, at);
            return Admission {
                alert,
                outcome: AdmitOutcome::Updated,
            };
        }

        // Nothing active: either a fresh incident or a reopen
        if let Some(previous) = shard.last_resolved.get(&signal.fingerprint) {
            if previous.ends_at.map(|end| at < end).unwrap_or(false) {
                debug!(fingerprint = %signal.fingerprint, "Ignoring signal older than resolution");
                return Admission {
                    alert: previous.clone(),
                    outcome: AdmitOutcome::Ignored,
                };
            }
        }

        shard.observe(&signal.fingerprint, at);
        let mut alert = new_alert(signal, AlertStatus::Firing);
        alert.starts_at = Some(at);
        self.start_firing(&mut shard, alert, signal)
    }

    /// Pending alert confirmed: becomes firing, possibly continuing a resolved incident
    fn promote(&self, shard: &mut Shard, mut pending: Alert, signal: &RawAlertSignal) -> Admission {
        shard.active.remove(&signal.fingerprint);
        pending.status = AlertStatus::Firing;
        pending.starts_at = Some(signal.triggered_at);
        pending.value = signal.value;
        pending.threshold = signal.threshold.clone();
        pending.annotations = annotations_for(signal);
        pending.updated_at = signal.triggered_at;

        let admission = self.start_firing(shard, pending.clone(), signal);
        if admission.alert.id != pending.id {
            // Folded into a reopened incident; the pending record is superseded
            self.view.remove(&pending.id);
        } else if admission.outcome == AdmitOutcome::Created {
            return Admission {
                outcome: AdmitOutcome::Promoted,
                ..admission
            };
        }
        admission
    }

    /// Insert a firing alert, applying the reopen policy against the last
    /// resolved alert of the fingerprint
    fn start_firing(&self, shard: &mut Shard, mut alert: Alert, signal: &RawAlertSignal) -> Admission {
        let at = signal.triggered_at;
        let grace = chrono_duration(self.config.reopen_grace());
        let previous = shard
            .last_resolved
            .get(&signal.fingerprint)
            .filter(|prev| prev.ends_at.map(|end| at - end <= grace).unwrap_or(false))
            .cloned();

        let (alert, outcome, kind) = match previous {
            Some(mut previous) => match self.config.reopen_policy {
                ReopenPolicy::ContinueIncident => {
                    previous.status = AlertStatus::Firing;
                    previous.ends_at = None;
                    previous.resolved_by = None;
                    previous.acknowledged_by = None;
                    previous.acknowledged_at = None;
                    previous.pending_since = alert.pending_since;
                    previous.value = signal.value;
                    previous.threshold = signal.threshold.clone();
                    previous.severity = signal.severity;
                    previous.annotations = annotations_for(signal);
                    previous.updated_at = at;
                    previous.reopen_count += 1;
                    shard.last_resolved.remove(&signal.fingerprint);
                    (previous, AdmitOutcome::Reopened, AlertEventKind::Reopened)
                }
                ReopenPolicy::LinkNew => {
                    alert.related_to = Some(previous.id.clone());
                    alert.reopen_count = previous.reopen_count + 1;
                    (alert, AdmitOutcome::Reopened, AlertEventKind::Reopened)
                }
            },
            None => (alert, AdmitOutcome::Created, AlertEventKind::Firing),
        };

        shard.active.insert(signal.fingerprint.clone(), alert.clone());
        self.view.insert(alert.id.clone(), alert.clone());
        self.publish(kind, &alert, at);
        Admission { alert, outcome }
    }

    /// Apply a clearance: resolves a confirmed alert, cancels a pending one
    pub async fn clear(&self, clearance: &Clearance) -> ClearOutcome {
        let mut shard = self.shard(&clearance.fingerprint).lock().await;
        let at = clearance.cleared_at;

        if !shard.active.contains_key(&clearance.fingerprint) {
            return ClearOutcome::Ignored;
        }
        if shard.is_stale(&clearance.fingerprint, at) {
            debug!(fingerprint = %clearance.fingerprint, "Ignoring stale clearance");
            return ClearOutcome::Ignored;
        }
        shard.observe(&clearance.fingerprint, at);

        let Some(mut alert) = shard.active.remove(&clearance.fingerprint) else {
            return ClearOutcome::Ignored;
        };

        if alert.status == AlertStatus::Pending {
            self.view.remove(&alert.id);
            alert.updated_at = at;
            self.publish(AlertEventKind::Cancelled, &alert, at);
            return ClearOutcome::Cancelled(alert);
        }

        alert.status = AlertStatus::Resolved;
        alert.ends_at = Some(at);
        alert.updated_at = alert.updated_at.max(at);
        shard
            .last_resolved
            .insert(clearance.fingerprint.clone(), alert.clone());
        self.view.insert(alert.id.clone(), alert.clone());
        self.publish(AlertEventKind::Resolved, &alert, at);
        ClearOutcome::Resolved(alert)
    }

    /// Operator acknowledgement; only firing alerts can be acknowledged
    pub async fn acknowledge(&self, id: &str, actor: &str) -> EngineResult<Alert> {
        let fingerprint = self.fingerprint_of(id)?;
        let mut shard = self.shard(&fingerprint).lock().await;

        let alert = match shard.active.get_mut(&fingerprint) {
            Some(alert) if alert.id == id => alert,
            _ => return Err(self.not_active(id)),
        };

        match alert.status {
            AlertStatus::Firing => {}
            AlertStatus::Pending => return Err(EngineError::AlertNotFiring(id.to_string())),
            status => {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    status,
                    action: "acknowledge",
                })
            }
        }

        let now = Utc::now().max(alert.updated_at);
        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(actor.to_string());
        alert.acknowledged_at = Some(now);
        alert.updated_at = now;
        let alert = alert.clone();

        self.view.insert(alert.id.clone(), alert.clone());
        self.publish(AlertEventKind::Acknowledged, &alert, now);
        Ok(alert)
    }

    /// Operator resolution of any non-resolved alert
    pub async fn resolve(&self, id: &str, actor: &str) -> EngineResult<Alert> {
        let fingerprint = self.fingerprint_of(id)?;
        let mut shard = self.shard(&fingerprint).lock().await;

        match shard.active.get(&fingerprint) {
            Some(alert) if alert.id == id => {}
            _ => return Err(self.not_active(id)),
        }
        let Some(mut alert) = shard.active.remove(&fingerprint) else {
            return Err(self.not_active(id));
        };

        let now = Utc::now().max(alert.updated_at);
        alert.status = AlertStatus::Resolved;
        alert.ends_at = Some(now);
        alert.updated_at = now;
        alert.resolved_by = Some(actor.to_string());

        shard.last_resolved.insert(fingerprint, alert.clone());
        self.view.insert(alert.id.clone(), alert.clone());
        self.publish(AlertEventKind::Resolved, &alert, now);
        Ok(alert)
    }

    fn fingerprint_of(&self, id: &str) -> EngineResult<String> {
        self.view
            .get(id)
            .map(|alert| alert.fingerprint.clone())
            .ok_or_else(|| EngineError::AlertNotFound(id.to_string()))
    }

    fn not_active(&self, id: &str) -> EngineError {
        match self.view.get(id) {
            Some(alert) => EngineError::InvalidTransition {
                id: id.to_string(),
                status: alert.status,
                action: "change",
            },
            None => EngineError::AlertNotFound(id.to_string()),
        }
    }

    pub fn get(&self, id: &str) -> Option<Alert> {
        self.view.get(id).map(|alert| alert.clone())
    }

    /// Alerts, newest update first, optionally filtered by status
    pub fn list(&self, status: Option<AlertStatus>) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self
            .view
            .iter()
            .filter(|entry| status.map(|s| entry.status == s).unwrap_or(true))
            .map(|entry| entry.value().clone())
            .collect();
        alerts.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        alerts
    }

    /// Non-resolved alert for a fingerprint
    pub async fn active_for(&self, fingerprint: &str) -> Option<Alert> {
        self.shard(fingerprint)
            .lock()
            .await
            .active
            .get(fingerprint)
            .cloned()
    }

    pub fn counts_by_status(&self) -> HashMap<AlertStatus, usize> {
        let mut counts = HashMap::new();
        for entry in self.view.iter() {
            *counts.entry(entry.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.events.subscribe()
    }

    /// Emit an event that is not a status change (e.g. analysis ready)
    pub fn notify(&self, kind: AlertEventKind, alert: &Alert) {
        self.publish(kind, alert, Utc::now());
    }

    /// Drop resolved alerts past retention. Returns the number removed.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono_duration(self.config.resolved_retention());
        let grace = chrono_duration(self.config.reopen_grace());
        let keep_for = retention.max(grace);

        for shard in &self.shards {
            let mut guard = shard.lock().await;
            let Shard {
                active,
                last_resolved,
                signal_at,
            } = &mut *guard;
            last_resolved.retain(|_, alert| {
                alert.ends_at.map(|end| now - end <= keep_for).unwrap_or(true)
            });
            signal_at.retain(|fp, _| active.contains_key(fp) || last_resolved.contains_key(fp));
        }

        let before = self.view.len();
        self.view.retain(|_, alert| {
            alert.status != AlertStatus::Resolved
                || alert.ends_at.map(|end| now - end <= retention).unwrap_or(true)
        });
        before - self.view.len()
    }

    /// Load previously persisted alerts without publishing events
    pub async fn restore(&self, alerts: Vec<Alert>) -> usize {
        let mut restored = 0;
        for alert in alerts {
            let mut shard = self.shard(&alert.fingerprint).lock().await;
            let slot = if alert.status.is_active() {
                &mut shard.active
            } else {
                &mut shard.last_resolved
            };
            let newer = slot
                .get(&alert.fingerprint)
                .map(|current| current.updated_at <= alert.updated_at)
                .unwrap_or(true);
            if newer {
                slot.insert(alert.fingerprint.clone(), alert.clone());
            }
            self.view.insert(alert.id.clone(), alert);
            restored += 1;
        }
        restored
    }
}

/// Rule annotations, plus a generated summary unless the rule supplies one
fn annotations_for(signal: &RawAlertSignal) -> BTreeMap<String, String> {
    let mut annotations = signal.annotations.clone();
    annotations
        .entry("summary".to_string())
        .or_insert_with(|| format!("{} breached with value {}", signal.rule_name, signal.value));
    annotations
}

fn new_alert(signal: &RawAlertSignal, status: AlertStatus) -> Alert {
    // Group labels win over static rule labels of the same name
    let mut labels = signal.rule_labels.clone();
    labels.extend(signal.group_labels.clone());
    labels
        .entry("alertname".to_string())
        .or_insert_with(|| signal.rule_name.clone());
    let annotations = annotations_for(signal);

    Alert {
        id: uuid::Uuid::new_v4().to_string(),
        rule_id: signal.rule_id.clone(),
        rule_name: signal.rule_name.clone(),
        fingerprint: signal.fingerprint.clone(),
        status,
        severity: signal.severity,
        labels,
        annotations,
        value: signal.value,
        threshold: signal.threshold.clone(),
        pending_since: None,
        starts_at: None,
        ends_at: None,
        updated_at: signal.triggered_at,
        acknowledged_by: None,
        acknowledged_at: None,
        resolved_by: None,
        reopen_count: 0,
        related_to: None,
    }
}

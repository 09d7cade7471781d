//! Notification dispatch with escalation, retries and duplicate suppression
//!
//! A firing alert is delivered in steps: step 0 is the rule's own channels,
//! later steps come from the rule's escalation policy. Before each step the
//! alert's current status is checked, so acknowledging or resolving an
//! alert stops its escalation. Every (alert, incarnation, step, channel,
//! kind) is delivered at most once.

use super::channel::{ChannelError, Deliver, Notification, NotificationKind, RateLimit};
use super::rate_limit::TokenBucket;
use crate::aggregator::{aggregate, group_of, AggregatedAlert, AggregationRule, AlertAggregator};
use crate::error::EngineError;
use crate::models::{Alert, AlertStatus};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::rules::RuleActions;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStep {
    /// Delay after the alert started firing
    #[serde(default)]
    pub delay_secs: u64,
    pub channels: Vec<String>,
    #[serde(default)]
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub id: String,
    pub steps: Vec<EscalationStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
    pub attempt_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            attempt_timeout_secs: 10,
        }
    }
}

impl RetryPolicy {
    /// Backoff after the given failed attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Sends in flight across all channels
    pub max_concurrent_sends: usize,
    /// Delivery records kept for queries
    pub max_records: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_sends: 32,
            max_records: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    /// Permanent failure, or retries exhausted
    Failed,
    /// Already sent for this alert, step and channel
    Suppressed,
    /// Covered by an aggregation group summary already delivered
    Folded,
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Delivered => write!(f, "delivered"),
            DeliveryOutcome::Failed => write!(f, "failed"),
            DeliveryOutcome::Suppressed => write!(f, "suppressed"),
            DeliveryOutcome::Folded => write!(f, "folded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub alert_id: String,
    pub incarnation: u32,
    pub step: usize,
    pub channel: String,
    pub kind: NotificationKind,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SentKey {
    alert_id: String,
    incarnation: u32,
    step: usize,
    channel: String,
    kind: NotificationKind,
}

impl SentKey {
    fn new(notification: &Notification, channel: &str) -> Self {
        Self {
            alert_id: notification.alert.id.clone(),
            incarnation: notification.alert.reopen_count,
            step: notification.step,
            channel: channel.to_string(),
            kind: notification.kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Marker {
    InFlight,
    Delivered,
    Failed,
}

struct ChannelSlot {
    channel: Arc<dyn Deliver>,
    limiter: TokenBucket,
}

pub struct NotificationDispatcher {
    channels: HashMap<String, Arc<ChannelSlot>>,
    policies: HashMap<String, EscalationPolicy>,
    aggregation: Vec<AggregationRule>,
    aggregator: Arc<AlertAggregator>,
    config: DispatcherConfig,
    sent: DashMap<SentKey, Marker>,
    records: Mutex<VecDeque<DeliveryRecord>>,
    groups_notified: DashMap<String, DateTime<Utc>>,
    escalations: DashMap<String, JoinHandle<()>>,
    io: Arc<Semaphore>,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl NotificationDispatcher {
    pub fn new(
        aggregator: Arc<AlertAggregator>,
        config: DispatcherConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            channels: HashMap::new(),
            policies: HashMap::new(),
            aggregation: Vec::new(),
            aggregator,
            io: Arc::new(Semaphore::new(config.max_concurrent_sends.max(1))),
            config,
            sent: DashMap::new(),
            records: Mutex::new(VecDeque::new()),
            groups_notified: DashMap::new(),
            escalations: DashMap::new(),
            logger,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn Deliver>, limit: &RateLimit) -> Self {
        self.channels.insert(
            channel.id().to_string(),
            Arc::new(ChannelSlot {
                channel,
                limiter: TokenBucket::new(limit),
            }),
        );
        self
    }

    pub fn with_policy(mut self, policy: EscalationPolicy) -> Self {
        self.policies.insert(policy.id.clone(), policy);
        self
    }

    pub fn with_aggregation(mut self, rules: Vec<AggregationRule>) -> Self {
        self.aggregation = rules;
        self
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn aggregation_rules(&self) -> &[AggregationRule] {
        &self.aggregation
    }

    /// Steps for a rule: its own channels first, then its escalation policy
    fn plan(&self, actions: &RuleActions) -> Vec<EscalationStep> {
        let mut steps = Vec::new();
        if !actions.notify.is_empty() {
            steps.push(EscalationStep {
                delay_secs: 0,
                channels: actions.notify.clone(),
                recipients: Vec::new(),
            });
        }
        if let Some(policy_id) = &actions.escalation_policy {
            match self.policies.get(policy_id) {
                Some(policy) => steps.extend(policy.steps.iter().cloned()),
                None => warn!(policy = %policy_id, "Unknown escalation policy"),
            }
        }
        steps
    }

    /// Start notifying a firing alert. Returns false if nothing is configured.
    pub fn dispatch(self: &Arc<Self>, alert: &Alert, actions: &RuleActions) -> bool {
        if alert.status != AlertStatus::Firing {
            return false;
        }
        let steps = self.plan(actions);
        if steps.is_empty() {
            return false;
        }

        let dispatcher = Arc::clone(self);
        let firing = alert.clone();
        let handle = tokio::spawn(async move { dispatcher.run_escalation(firing, steps).await });
        if let Some(previous) = self.escalations.insert(alert.id.clone(), handle) {
            previous.abort();
        }
        true
    }

    async fn run_escalation(self: Arc<Self>, alert: Alert, steps: Vec<EscalationStep>) {
        let started = tokio::time::Instant::now();

        for (index, step) in steps.into_iter().enumerate() {
            tokio::time::sleep_until(started + Duration::from_secs(step.delay_secs)).await;

            if !self.still_firing(&alert) {
                debug!(alert_id = %alert.id, step = index, "Alert no longer firing, escalation stopped");
                return;
            }

            let group = if index == 0 { self.group_for(&alert) } else { None };
            if let Some(group) = &group {
                if self.already_summarized(group) {
                    for channel in &step.channels {
                        let notification = self.notification(&alert, NotificationKind::Firing, index, &step, None);
                        self.record(&notification, channel, DeliveryOutcome::Folded, 0, None);
                    }
                    continue;
                }
            }

            let mut sends = JoinSet::new();
            for channel in step.channels.iter().cloned() {
                let notification =
                    self.notification(&alert, NotificationKind::Firing, index, &step, group.clone());
                let dispatcher = Arc::clone(&self);
                sends.spawn(async move { dispatcher.deliver(&channel, notification).await });
            }
            while sends.join_next().await.is_some() {}
        }
    }

    fn notification(
        &self,
        alert: &Alert,
        kind: NotificationKind,
        step: usize,
        plan: &EscalationStep,
        group: Option<AggregatedAlert>,
    ) -> Notification {
        Notification {
            alert: alert.clone(),
            kind,
            step,
            recipients: plan.recipients.clone(),
            group,
        }
    }

    fn still_firing(&self, alert: &Alert) -> bool {
        self.aggregator
            .get(&alert.id)
            .map(|current| {
                current.status == AlertStatus::Firing && current.reopen_count == alert.reopen_count
            })
            .unwrap_or(false)
    }

    fn group_for(&self, alert: &Alert) -> Option<AggregatedAlert> {
        if self.aggregation.is_empty() {
            return None;
        }
        let alerts = self.aggregator.list(None);
        let groups = aggregate(&self.aggregation, &alerts, Utc::now());
        group_of(&groups, alert).cloned()
    }

    /// True if this group's summary went out within its window; otherwise
    /// marks it as sent now
    fn already_summarized(&self, group: &AggregatedAlert) -> bool {
        let window_secs = self
            .aggregation
            .iter()
            .find(|rule| rule.name == group.rule)
            .map(|rule| rule.window_secs)
            .unwrap_or(0);
        let window = chrono::Duration::seconds(window_secs.min(i64::MAX as u64) as i64);
        let key = format!("{}|{:?}", group.rule, group.labels);
        let now = Utc::now();

        match self.groups_notified.entry(key) {
            Entry::Occupied(mut entry) => {
                if now - *entry.get() < window {
                    true
                } else {
                    entry.insert(now);
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                false
            }
        }
    }

    /// Deliver one notification on one channel, at most once per key
    pub async fn deliver(&self, channel_id: &str, notification: Notification) -> DeliveryRecord {
        let Some(slot) = self.channels.get(channel_id).cloned() else {
            let failure = send_failure(
                channel_id,
                ChannelError::NotConfigured(format!("unknown channel {}", channel_id)),
            );
            return self.record(
                &notification,
                channel_id,
                DeliveryOutcome::Failed,
                0,
                Some(failure.to_string()),
            );
        };

        let key = SentKey::new(&notification, channel_id);
        match self.sent.entry(key.clone()) {
            Entry::Occupied(_) => {
                return self.record(&notification, channel_id, DeliveryOutcome::Suppressed, 0, None);
            }
            Entry::Vacant(entry) => {
                entry.insert(Marker::InFlight);
            }
        }

        // Wait for the channel's own budget before taking a shared send slot
        slot.limiter.acquire().await;

        let (attempts, result) = self.send_with_retry(slot.channel.as_ref(), &notification).await;
        match result {
            Ok(()) => {
                self.sent.insert(key, Marker::Delivered);
                self.record(&notification, channel_id, DeliveryOutcome::Delivered, attempts, None)
            }
            Err(e) => {
                self.sent.insert(key, Marker::Failed);
                let failure = send_failure(channel_id, e);
                self.record(
                    &notification,
                    channel_id,
                    DeliveryOutcome::Failed,
                    attempts,
                    Some(failure.to_string()),
                )
            }
        }
    }

    async fn send_with_retry(
        &self,
        channel: &dyn Deliver,
        notification: &Notification,
    ) -> (u32, Result<(), ChannelError>) {
        let policy = &self.config.retry;
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            // A send slot is held per attempt only, never across a backoff
            let result = match self.io.acquire().await {
                Ok(_permit) => {
                    tokio::time::timeout(policy.attempt_timeout(), channel.send(notification))
                        .await
                        .unwrap_or(Err(ChannelError::Timeout))
                }
                Err(_) => {
                    return (
                        attempt - 1,
                        Err(ChannelError::NotConfigured("dispatcher shut down".to_string())),
                    )
                }
            };

            match result {
                Ok(()) => return (attempt, Ok(())),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let backoff = policy.backoff(attempt);
                    debug!(
                        channel = %channel.id(),
                        attempt = attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Retrying notification"
                    );
                    self.metrics.inc_notification_retry();
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return (attempt, Err(e)),
            }
        }
    }

    /// Notify the step-0 channels that previously received the firing
    /// notification. Also stops any pending escalation.
    pub fn notify_resolved(self: &Arc<Self>, alert: &Alert, actions: &RuleActions) -> bool {
        self.cancel(&alert.id);
        if !actions.notify_resolved || alert.status != AlertStatus::Resolved {
            return false;
        }

        let channels: Vec<String> = actions
            .notify
            .iter()
            .filter(|channel| {
                let key = SentKey {
                    alert_id: alert.id.clone(),
                    incarnation: alert.reopen_count,
                    step: 0,
                    channel: channel.to_string(),
                    kind: NotificationKind::Firing,
                };
                self.sent.get(&key).map(|m| *m == Marker::Delivered).unwrap_or(false)
            })
            .cloned()
            .collect();
        if channels.is_empty() {
            return false;
        }

        for channel in channels {
            let dispatcher = Arc::clone(self);
            let notification = Notification {
                alert: alert.clone(),
                kind: NotificationKind::Resolved,
                step: 0,
                recipients: Vec::new(),
                group: None,
            };
            tokio::spawn(async move {
                dispatcher.deliver(&channel, notification).await;
            });
        }
        true
    }

    /// Stop a pending escalation. Returns true if one was running.
    pub fn cancel(&self, alert_id: &str) -> bool {
        match self.escalations.remove(alert_id) {
            Some((_, handle)) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    fn record(
        &self,
        notification: &Notification,
        channel: &str,
        outcome: DeliveryOutcome,
        attempts: u32,
        error: Option<String>,
    ) -> DeliveryRecord {
        let record = DeliveryRecord {
            alert_id: notification.alert.id.clone(),
            incarnation: notification.alert.reopen_count,
            step: notification.step,
            channel: channel.to_string(),
            kind: notification.kind,
            outcome,
            attempts,
            error,
            at: Utc::now(),
        };

        self.metrics
            .inc_notification(channel, &outcome.to_string());
        self.logger.log_notification(
            &record.alert_id,
            channel,
            record.step,
            &outcome.to_string(),
            attempts,
            record.error.as_deref(),
        );

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push_back(record.clone());
        while records.len() > self.config.max_records.max(1) {
            records.pop_front();
        }
        record
    }

    /// Delivery history, optionally for one alert
    pub fn records(&self, alert_id: Option<&str>) -> Vec<DeliveryRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| alert_id.map(|id| r.alert_id == id).unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Permanent failures
    pub fn failures(&self) -> Vec<DeliveryRecord> {
        self.records(None)
            .into_iter()
            .filter(|r| r.outcome == DeliveryOutcome::Failed)
            .collect()
    }

    /// Forget markers and escalations of alerts the store no longer holds
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let before = self.sent.len();
        self.sent
            .retain(|key, marker| *marker == Marker::InFlight || self.aggregator.get(&key.alert_id).is_some());
        self.escalations.retain(|_, handle| !handle.is_finished());
        self.groups_notified
            .retain(|_, at| now - *at < chrono::Duration::hours(24));
        before - self.sent.len()
    }
}

/// Final outcome of a delivery that will not be retried again
fn send_failure(channel_id: &str, error: ChannelError) -> EngineError {
    EngineError::ChannelSendFailure {
        channel: channel_id.to_string(),
        retryable: error.is_retryable(),
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{fingerprint, AggregatorConfig};
    use crate::models::{Labels, RawAlertSignal, Severity, Threshold};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedChannel {
        id: String,
        failures_left: AtomicU32,
        failure: ChannelError,
        calls: AtomicU32,
        sent: Mutex<Vec<Notification>>,
    }

    impl ScriptedChannel {
        fn new(id: &str, failures: u32, failure: ChannelError) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                failures_left: AtomicU32::new(failures),
                failure,
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn ok(id: &str) -> Arc<Self> {
            Self::new(id, 0, ChannelError::Timeout)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Deliver for ScriptedChannel {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> crate::notify::ChannelKind {
            crate::notify::ChannelKind::Webhook
        }

        async fn send(&self, notification: &Notification) -> Result<(), ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(self.failure.clone());
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn fast_retry() -> DispatcherConfig {
        DispatcherConfig {
            retry: RetryPolicy {
                max_attempts: 4,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
                multiplier: 2.0,
                attempt_timeout_secs: 5,
            },
            ..Default::default()
        }
    }

    fn labels(host: &str, dc: &str) -> Labels {
        let mut labels = Labels::new();
        labels.insert("host".into(), host.into());
        labels.insert("dc".into(), dc.into());
        labels
    }

    async fn firing_alert(aggregator: &AlertAggregator, host: &str) -> Alert {
        let group_labels = labels(host, "eu");
        let signal = RawAlertSignal {
            rule_id: "R1".into(),
            rule_name: "HighCpu".into(),
            fingerprint: fingerprint("R1", &group_labels),
            group_labels,
            rule_labels: Labels::new(),
            annotations: Default::default(),
            severity: Severity::Critical,
            value: 95.0,
            threshold: Threshold {
                upper: Some(80.0),
                confidence: 1.0,
                ..Default::default()
            },
            triggered_at: Utc::now(),
        };
        aggregator.admit(&signal).await.alert
    }

    fn aggregator() -> Arc<AlertAggregator> {
        Arc::new(AlertAggregator::new(
            AggregatorConfig::default(),
            StructuredLogger::new("test"),
        ))
    }

    fn actions(channels: &[&str], policy: Option<&str>) -> RuleActions {
        RuleActions {
            notify: channels.iter().map(|c| c.to_string()).collect(),
            escalation_policy: policy.map(String::from),
            ..Default::default()
        }
    }

    async fn wait_for_records(dispatcher: &NotificationDispatcher, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while dispatcher.records(None).len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("records did not arrive");
    }

    fn notification(alert: &Alert, step: usize) -> Notification {
        Notification {
            alert: alert.clone(),
            kind: NotificationKind::Firing,
            step,
            recipients: Vec::new(),
            group: None,
        }
    }

    #[test]
    fn test_backoff_is_bounded_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(20), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn test_flaky_channel_delivers_exactly_once() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let flaky = ScriptedChannel::new("ops", 3, ChannelError::Transport("reset".into()));
        let dispatcher = NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
            .with_channel(flaky.clone(), &RateLimit::default());

        let record = dispatcher.deliver("ops", notification(&alert, 0)).await;
        assert_eq!(record.outcome, DeliveryOutcome::Delivered);
        assert_eq!(record.attempts, 4);
        assert_eq!(flaky.calls(), 4);
        assert_eq!(flaky.sent.lock().unwrap().len(), 1);

        let again = dispatcher.deliver("ops", notification(&alert, 0)).await;
        assert_eq!(again.outcome, DeliveryOutcome::Suppressed);
        assert_eq!(flaky.calls(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let broken = ScriptedChannel::new(
            "ops",
            10,
            ChannelError::Status {
                status: 400,
                body: "bad request".into(),
            },
        );
        let dispatcher = NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
            .with_channel(broken.clone(), &RateLimit::default());

        let record = dispatcher.deliver("ops", notification(&alert, 0)).await;
        assert_eq!(record.outcome, DeliveryOutcome::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(dispatcher.failures().len(), 1);
        assert_eq!(
            record.error.as_deref(),
            Some("delivery via channel ops failed: receiver returned status 400: bad request")
        );
    }

    #[test]
    fn test_send_failure_keeps_retryability() {
        match send_failure("mail", ChannelError::Timeout) {
            EngineError::ChannelSendFailure {
                channel, retryable, ..
            } => {
                assert_eq!(channel, "mail");
                assert!(retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            send_failure("mail", ChannelError::Payload("bad".into())),
            EngineError::ChannelSendFailure {
                retryable: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_throttled_channel_leaves_send_slots_free() {
        let aggregator = aggregator();
        let mut alerts = Vec::new();
        for host in ["web-01", "web-02", "web-03", "web-04"] {
            alerts.push(firing_alert(&aggregator, host).await);
        }
        let slow = ScriptedChannel::ok("slow");
        let fast = ScriptedChannel::ok("fast");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                aggregator,
                DispatcherConfig {
                    max_concurrent_sends: 2,
                    ..fast_retry()
                },
                StructuredLogger::new("test"),
            )
            .with_channel(
                slow.clone(),
                &RateLimit {
                    capacity: 1,
                    per_second: 0.01,
                },
            )
            .with_channel(fast.clone(), &RateLimit::default()),
        );

        // One token, then roughly 100s per send: two of these stay throttled
        for alert in &alerts[..3] {
            let dispatcher = Arc::clone(&dispatcher);
            let notification = notification(alert, 0);
            tokio::spawn(async move { dispatcher.deliver("slow", notification).await });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let record = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.deliver("fast", notification(&alerts[3], 0)),
        )
        .await
        .expect("fast channel waited on a throttled one");
        assert_eq!(record.outcome, DeliveryOutcome::Delivered);
        assert_eq!(fast.calls(), 1);
        assert_eq!(slow.calls(), 1);
    }

    #[tokio::test]
    async fn test_backoff_does_not_hold_a_send_slot() {
        let aggregator = aggregator();
        let first = firing_alert(&aggregator, "web-01").await;
        let second = firing_alert(&aggregator, "web-02").await;
        let flaky = ScriptedChannel::new("flaky", 1, ChannelError::Transport("reset".into()));
        let fast = ScriptedChannel::ok("fast");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                aggregator,
                DispatcherConfig {
                    max_concurrent_sends: 1,
                    retry: RetryPolicy {
                        initial_backoff_ms: 3_000,
                        max_backoff_ms: 3_000,
                        ..fast_retry().retry
                    },
                    ..Default::default()
                },
                StructuredLogger::new("test"),
            )
            .with_channel(flaky.clone(), &RateLimit::default())
            .with_channel(fast.clone(), &RateLimit::default()),
        );

        let retrying = {
            let dispatcher = Arc::clone(&dispatcher);
            let notification = notification(&first, 0);
            tokio::spawn(async move { dispatcher.deliver("flaky", notification).await })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while flaky.calls() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("first attempt never ran");

        let record = tokio::time::timeout(
            Duration::from_secs(1),
            dispatcher.deliver("fast", notification(&second, 0)),
        )
        .await
        .expect("send slot held through backoff");
        assert_eq!(record.outcome, DeliveryOutcome::Delivered);

        let retried = retrying.await.unwrap();
        assert_eq!(retried.outcome, DeliveryOutcome::Delivered);
        assert_eq!(retried.attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let down = ScriptedChannel::new(
            "ops",
            100,
            ChannelError::Status {
                status: 503,
                body: String::new(),
            },
        );
        let dispatcher = NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
            .with_channel(down.clone(), &RateLimit::default());

        let record = dispatcher.deliver("ops", notification(&alert, 0)).await;
        assert_eq!(record.outcome, DeliveryOutcome::Failed);
        assert_eq!(record.attempts, 4);
        assert_eq!(down.calls(), 4);
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_block_others() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let good = ScriptedChannel::ok("chat");
        let bad = ScriptedChannel::new("mail", 100, ChannelError::NotConfigured("no smtp".into()));
        let dispatcher = Arc::new(
            NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
                .with_channel(good.clone(), &RateLimit::default())
                .with_channel(bad, &RateLimit::default()),
        );

        assert!(dispatcher.dispatch(&alert, &actions(&["mail", "chat", "missing"], None)));
        wait_for_records(&dispatcher, 3).await;

        assert_eq!(good.calls(), 1);
        let failures = dispatcher.failures();
        assert_eq!(failures.len(), 2);
    }

    #[tokio::test]
    async fn test_escalation_stops_when_acknowledged() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let ops = ScriptedChannel::ok("ops");
        let pager = ScriptedChannel::ok("pager");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(aggregator.clone(), fast_retry(), StructuredLogger::new("test"))
                .with_channel(ops.clone(), &RateLimit::default())
                .with_channel(pager.clone(), &RateLimit::default())
                .with_policy(EscalationPolicy {
                    id: "oncall".into(),
                    steps: vec![EscalationStep {
                        delay_secs: 1,
                        channels: vec!["pager".into()],
                        recipients: Vec::new(),
                    }],
                }),
        );

        dispatcher.dispatch(&alert, &actions(&["ops"], Some("oncall")));
        wait_for_records(&dispatcher, 1).await;
        aggregator.acknowledge(&alert.id, "oncall-engineer").await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(ops.calls(), 1);
        assert_eq!(pager.calls(), 0);
    }

    #[tokio::test]
    async fn test_escalation_reaches_later_steps_and_cancel_stops_it() {
        let aggregator = aggregator();
        let first = firing_alert(&aggregator, "web-01").await;
        let second = firing_alert(&aggregator, "web-02").await;
        let pager = ScriptedChannel::ok("pager");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
                .with_channel(pager.clone(), &RateLimit::default())
                .with_policy(EscalationPolicy {
                    id: "oncall".into(),
                    steps: vec![EscalationStep {
                        delay_secs: 1,
                        channels: vec!["pager".into()],
                        recipients: vec!["lead@example.com".into()],
                    }],
                }),
        );

        dispatcher.dispatch(&first, &actions(&[], Some("oncall")));
        dispatcher.dispatch(&second, &actions(&[], Some("oncall")));
        assert!(dispatcher.cancel(&second.id));

        wait_for_records(&dispatcher, 1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(pager.calls(), 1);
        let sent = pager.sent.lock().unwrap();
        assert_eq!(sent[0].alert.id, first.id);
        assert_eq!(sent[0].step, 0);
        assert_eq!(sent[0].recipients, vec!["lead@example.com"]);
    }

    #[tokio::test]
    async fn test_resolved_notification_follows_delivered_firing() {
        let aggregator = aggregator();
        let alert = firing_alert(&aggregator, "web-01").await;
        let ops = ScriptedChannel::ok("ops");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(aggregator.clone(), fast_retry(), StructuredLogger::new("test"))
                .with_channel(ops.clone(), &RateLimit::default()),
        );
        let rule_actions = actions(&["ops"], None);

        dispatcher.dispatch(&alert, &rule_actions);
        wait_for_records(&dispatcher, 1).await;

        let resolved = aggregator.resolve(&alert.id, "oncall").await.unwrap();
        assert!(dispatcher.notify_resolved(&resolved, &rule_actions));
        wait_for_records(&dispatcher, 2).await;

        let sent = ops.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].kind, NotificationKind::Resolved);
    }

    #[tokio::test]
    async fn test_aggregated_alerts_are_folded() {
        let aggregator = aggregator();
        let first = firing_alert(&aggregator, "web-01").await;
        let second = firing_alert(&aggregator, "web-02").await;
        let ops = ScriptedChannel::ok("ops");
        let dispatcher = Arc::new(
            NotificationDispatcher::new(aggregator, fast_retry(), StructuredLogger::new("test"))
                .with_channel(ops.clone(), &RateLimit::default())
                .with_aggregation(vec![AggregationRule {
                    name: "dc".into(),
                    group_labels: vec!["dc".into()],
                    min_alerts: 2,
                    window_secs: 300,
                }]),
        );

        dispatcher.dispatch(&first, &actions(&["ops"], None));
        wait_for_records(&dispatcher, 1).await;
        dispatcher.dispatch(&second, &actions(&["ops"], None));
        wait_for_records(&dispatcher, 2).await;

        assert_eq!(ops.calls(), 1);
        let sent = ops.sent.lock().unwrap();
        assert_eq!(sent[0].group.as_ref().map(|g| g.count), Some(2));

        let folded = dispatcher.records(Some(&second.id));
        assert_eq!(folded[0].outcome, DeliveryOutcome::Folded);
    }
}

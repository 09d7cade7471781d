//! Engine wiring
//!
//! Connects the pipeline: ingest buffer → scheduled rule evaluation →
//! aggregation → notification dispatch and root-cause analysis. The
//! `AlertEngine` is the single entry point used by the daemon's API.

use crate::aggregator::{
    aggregate, AdmitOutcome, AggregatedAlert, AggregationRule, AggregatorConfig, AlertAggregator,
    ClearOutcome,
};
use crate::anomaly::{build_detector, DetectorKind};
use crate::error::{EngineError, EngineResult};
use crate::evaluator::{
    EvaluationReport, EvaluationScheduler, EvaluatorConfig, GroupTransition, RuleEvaluator,
    SchedulerConfig,
};
use crate::health::{components, HealthRegistry};
use crate::ingest::{BufferConfig, BufferStats, IngestBuffer};
use crate::knowledge::KnowledgeRetriever;
use crate::models::{
    Alert, AlertEvent, AlertEventKind, AlertStatus, Clearance, MetricSample, RootCauseAnalysis,
};
use crate::notify::{
    Deliver, DeliveryRecord, DispatcherConfig, EscalationPolicy, NotificationDispatcher, RateLimit,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::persistence::{AlertRepository, NoopRepository};
use crate::rca::{AiProvider, AnalyzerConfig, RootCauseAnalyzer};
use crate::rules::{AlertRule, RuleRegistry};
use crate::threshold::ThresholdCalculator;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub node_name: String,
    pub buffer: BufferConfig,
    pub detector: DetectorKind,
    pub evaluator: EvaluatorConfig,
    pub scheduler: SchedulerConfig,
    pub aggregator: AggregatorConfig,
    pub dispatcher: DispatcherConfig,
    pub analyzer: AnalyzerConfig,
    pub maintenance_interval: Duration,
    /// Evaluation reports waiting to be applied
    pub report_queue: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_name: "alert-engine".to_string(),
            buffer: BufferConfig::default(),
            detector: DetectorKind::default(),
            evaluator: EvaluatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            aggregator: AggregatorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            analyzer: AnalyzerConfig::default(),
            maintenance_interval: Duration::from_secs(30),
            report_queue: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub accepted: usize,
    pub dropped: usize,
}

pub struct AlertEngineBuilder {
    config: EngineConfig,
    registry: Option<Arc<RuleRegistry>>,
    channels: Vec<(Arc<dyn Deliver>, RateLimit)>,
    policies: Vec<EscalationPolicy>,
    aggregation: Vec<AggregationRule>,
    provider: Option<Arc<dyn AiProvider>>,
    retriever: Option<Arc<KnowledgeRetriever>>,
    repository: Option<Arc<dyn AlertRepository>>,
    health: Option<Arc<HealthRegistry>>,
}

impl AlertEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: None,
            channels: Vec::new(),
            policies: Vec::new(),
            aggregation: Vec::new(),
            provider: None,
            retriever: None,
            repository: None,
            health: None,
        }
    }

    pub fn registry(mut self, registry: Arc<RuleRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn channel(mut self, channel: Arc<dyn Deliver>, limit: RateLimit) -> Self {
        self.channels.push((channel, limit));
        self
    }

    pub fn policy(mut self, policy: EscalationPolicy) -> Self {
        self.policies.push(policy);
        self
    }

    pub fn aggregation(mut self, rules: Vec<AggregationRule>) -> Self {
        self.aggregation = rules;
        self
    }

    pub fn provider(mut self, provider: Arc<dyn AiProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn retriever(mut self, retriever: Arc<KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn repository(mut self, repository: Arc<dyn AlertRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn build(self) -> Arc<AlertEngine> {
        let config = self.config;
        let logger = StructuredLogger::new(config.node_name.clone());

        let buffer = Arc::new(IngestBuffer::new(config.buffer.clone()));
        let calculator = Arc::new(ThresholdCalculator::new(
            Arc::clone(&buffer),
            build_detector(config.detector),
        ));
        let evaluator = Arc::new(RuleEvaluator::new(
            Arc::clone(&buffer),
            calculator,
            config.evaluator.clone(),
        ));
        let aggregator = Arc::new(AlertAggregator::new(
            config.aggregator.clone(),
            logger.clone(),
        ));

        let mut dispatcher = NotificationDispatcher::new(
            Arc::clone(&aggregator),
            config.dispatcher.clone(),
            logger.clone(),
        )
        .with_aggregation(self.aggregation);
        for (channel, limit) in self.channels {
            dispatcher = dispatcher.with_channel(channel, &limit);
        }
        for policy in self.policies {
            dispatcher = dispatcher.with_policy(policy);
        }

        let mut analyzer =
            RootCauseAnalyzer::new(Arc::clone(&buffer), config.analyzer.clone(), logger.clone());
        if let Some(provider) = self.provider {
            analyzer = analyzer.with_provider(provider);
        }
        if let Some(retriever) = self.retriever {
            analyzer = analyzer.with_retriever(retriever);
        }

        Arc::new(AlertEngine {
            buffer,
            registry: self.registry.unwrap_or_default(),
            evaluator,
            aggregator,
            dispatcher: Arc::new(dispatcher),
            analyzer: Arc::new(analyzer),
            repository: self
                .repository
                .unwrap_or_else(|| Arc::new(NoopRepository)),
            analyses: DashMap::new(),
            health: self.health.unwrap_or_default(),
            scheduler: config.scheduler.clone(),
            maintenance_interval: config.maintenance_interval,
            report_queue: config.report_queue.max(1),
            logger,
            metrics: EngineMetrics::new(),
        })
    }
}

pub struct AlertEngine {
    buffer: Arc<IngestBuffer>,
    registry: Arc<RuleRegistry>,
    evaluator: Arc<RuleEvaluator>,
    aggregator: Arc<AlertAggregator>,
    dispatcher: Arc<NotificationDispatcher>,
    analyzer: Arc<RootCauseAnalyzer>,
    repository: Arc<dyn AlertRepository>,
    analyses: DashMap<String, RootCauseAnalysis>,
    health: Arc<HealthRegistry>,
    scheduler: SchedulerConfig,
    maintenance_interval: Duration,
    report_queue: usize,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl AlertEngine {
    pub fn builder(config: EngineConfig) -> AlertEngineBuilder {
        AlertEngineBuilder::new(config)
    }

    pub fn registry(&self) -> &Arc<RuleRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    pub fn channel_ids(&self) -> Vec<String> {
        self.dispatcher.channel_ids()
    }

    /// Accept a batch of samples. Never waits on evaluation or dispatch.
    pub fn ingest(&self, samples: Vec<MetricSample>) -> IngestSummary {
        let total = samples.len();
        let accepted = self.buffer.ingest_batch(samples);
        let dropped = total - accepted;
        self.metrics.record_ingest(accepted as u64, dropped as u64);
        if dropped > 0 {
            debug!(accepted = accepted, dropped = dropped, "Samples dropped at ingest");
        }
        IngestSummary { accepted, dropped }
    }

    pub fn buffer_stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Load alerts and analyses from the repository
    pub async fn restore(&self) -> EngineResult<usize> {
        let alerts = self.repository.load_alerts().await?;
        let seeded = self
            .evaluator
            .seed(&alerts, &self.registry.snapshot(), Utc::now());
        let restored = self.aggregator.restore(alerts).await;
        for analysis in self.repository.load_analyses().await? {
            self.analyses.insert(analysis.alert_id.clone(), analysis);
        }
        info!(
            alerts = restored,
            groups = seeded,
            analyses = self.analyses.len(),
            "Alert state restored"
        );
        Ok(restored)
    }

    /// Evaluate every enabled rule once at `now` and apply the results
    pub async fn evaluate_now(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let snapshot = self.registry.snapshot();
        let mut evaluated = 0;
        for rule in snapshot.enabled() {
            let report = self.evaluator.evaluate(rule, now).await;
            self.apply_report(report).await;
            evaluated += 1;
        }
        evaluated
    }

    /// Feed one evaluation result into the aggregator and its side effects
    pub async fn apply_report(self: &Arc<Self>, report: EvaluationReport) {
        self.metrics
            .inc_group_evaluations("evaluated", report.groups_evaluated as u64);
        if !report.inconclusive.is_empty() {
            self.metrics
                .inc_group_evaluations("inconclusive", report.inconclusive.len() as u64);
            for group in &report.inconclusive {
                self.logger
                    .log_inconclusive(&report.rule_id, &group.fingerprint, &group.reason);
            }
        }

        let rule = self.registry.get(&report.rule_id);
        for transition in report.transitions {
            match transition {
                GroupTransition::Pending(signal) => {
                    let admission = self.aggregator.admit_pending(&signal).await;
                    if admission.outcome != AdmitOutcome::Ignored {
                        self.persist(&admission.alert).await;
                    }
                }
                GroupTransition::Firing(signal) => {
                    let admission = self.aggregator.admit(&signal).await;
                    if admission.outcome == AdmitOutcome::Ignored {
                        continue;
                    }
                    self.persist(&admission.alert).await;
                    if !admission.started_firing() {
                        continue;
                    }
                    if let Some(rule) = &rule {
                        self.dispatcher.dispatch(&admission.alert, &rule.actions);
                        if rule.actions.analyze {
                            self.spawn_analysis(admission.alert.clone(), Arc::clone(rule));
                        }
                    }
                }
                GroupTransition::Cleared(clearance) => {
                    self.apply_clearance(&clearance, rule.as_deref()).await;
                }
            }
        }
    }

    async fn apply_clearance(&self, clearance: &Clearance, rule: Option<&AlertRule>) {
        match self.aggregator.clear(clearance).await {
            ClearOutcome::Resolved(alert) => {
                self.persist(&alert).await;
                match rule {
                    Some(rule) => {
                        self.dispatcher.notify_resolved(&alert, &rule.actions);
                    }
                    None => {
                        self.dispatcher.cancel(&alert.id);
                    }
                }
            }
            ClearOutcome::Cancelled(alert) => {
                if let Err(e) = self.repository.delete_alert(&alert.id).await {
                    warn!(alert_id = %alert.id, error = %e, "Failed to delete cancelled alert");
                }
            }
            ClearOutcome::Ignored => {}
        }
    }

    fn spawn_analysis(self: &Arc<Self>, alert: Alert, rule: Arc<AlertRule>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.analyzer.analyze(&alert, &rule).await {
                Ok(analysis) => engine.store_analysis(analysis).await,
                Err(e) => debug!(alert_id = %alert.id, error = %e, "Analysis skipped"),
            }
        });
    }

    /// Keep an analysis and announce it if its alert is still live
    async fn store_analysis(&self, analysis: RootCauseAnalysis) {
        if let Err(e) = self.repository.save_analysis(&analysis).await {
            warn!(alert_id = %analysis.alert_id, error = %e, "Failed to persist analysis");
        }
        let alert_id = analysis.alert_id.clone();
        self.analyses.insert(alert_id.clone(), analysis);

        match self.aggregator.get(&alert_id) {
            Some(alert) if alert.status.is_confirmed() => {
                self.aggregator.notify(AlertEventKind::AnalysisReady, &alert);
            }
            _ => debug!(alert_id = %alert_id, "Analysis finished after alert resolved, stored only"),
        }
    }

    /// Run (or re-serve from cache) the analysis for a confirmed alert
    pub async fn request_analysis(&self, alert_id: &str) -> EngineResult<RootCauseAnalysis> {
        let alert = self
            .aggregator
            .get(alert_id)
            .ok_or_else(|| EngineError::AlertNotFound(alert_id.to_string()))?;
        let rule = self.registry.get(&alert.rule_id).ok_or_else(|| {
            EngineError::AiAnalysisUnavailable(format!("rule {} no longer exists", alert.rule_id))
        })?;

        let analysis = self.analyzer.analyze(&alert, &rule).await?;
        self.store_analysis(analysis.clone()).await;
        Ok(analysis)
    }

    pub fn analysis(&self, alert_id: &str) -> Option<RootCauseAnalysis> {
        self.analyses.get(alert_id).map(|a| a.clone())
    }

    pub async fn acknowledge(&self, alert_id: &str, actor: &str) -> EngineResult<Alert> {
        let alert = self.aggregator.acknowledge(alert_id, actor).await?;
        self.dispatcher.cancel(alert_id);
        self.persist(&alert).await;
        Ok(alert)
    }

    pub async fn resolve(&self, alert_id: &str, actor: &str) -> EngineResult<Alert> {
        let alert = self.aggregator.resolve(alert_id, actor).await?;
        self.persist(&alert).await;
        match self.registry.get(&alert.rule_id) {
            Some(rule) => {
                self.dispatcher.notify_resolved(&alert, &rule.actions);
            }
            None => {
                self.dispatcher.cancel(alert_id);
            }
        }
        Ok(alert)
    }

    pub fn alert(&self, alert_id: &str) -> Option<Alert> {
        self.aggregator.get(alert_id)
    }

    pub fn alerts(&self, status: Option<AlertStatus>) -> Vec<Alert> {
        self.aggregator.list(status)
    }

    pub fn aggregated(&self, now: DateTime<Utc>) -> Vec<AggregatedAlert> {
        let alerts = self.aggregator.list(None);
        aggregate(self.dispatcher.aggregation_rules(), &alerts, now)
    }

    pub fn deliveries(&self, alert_id: Option<&str>) -> Vec<DeliveryRecord> {
        self.dispatcher.records(alert_id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.aggregator.subscribe()
    }

    /// Validate and store a rule; effective on its next tick
    pub fn upsert_rule(&self, rule: AlertRule) -> EngineResult<bool> {
        let created = self.registry.upsert(rule)?;
        self.metrics
            .set_rules_loaded(self.registry.snapshot().len() as i64);
        Ok(created)
    }

    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let removed = self.registry.remove(rule_id);
        self.metrics
            .set_rules_loaded(self.registry.snapshot().len() as i64);
        removed
    }

    async fn persist(&self, alert: &Alert) {
        if let Err(e) = self.repository.save_alert(alert).await {
            warn!(alert_id = %alert.id, error = %e, "Failed to persist alert");
        }
    }

    /// Periodic housekeeping: retention, removed rules, gauges and health
    pub async fn maintain(&self, now: DateTime<Utc>) {
        let evicted_series = self.buffer.prune(now);
        let stats = self.buffer.stats();
        self.metrics.set_active_series(stats.series as i64);

        let snapshot = self.registry.snapshot();
        for clearance in self.evaluator.forget_missing(&snapshot, now) {
            self.apply_clearance(&clearance, None).await;
        }

        let pruned_alerts = self.aggregator.prune(now).await;
        self.analyses
            .retain(|alert_id, _| self.aggregator.get(alert_id).is_some());
        self.analyzer.prune();
        self.dispatcher.prune(now);

        let retention = crate::models::chrono_duration(self.aggregator.config().resolved_retention());
        if let Err(e) = self.repository.prune(now - retention).await {
            warn!(error = %e, "Failed to prune persisted alerts");
        }

        let counts = self.aggregator.counts_by_status();
        for status in [
            AlertStatus::Pending,
            AlertStatus::Firing,
            AlertStatus::Acknowledged,
            AlertStatus::Resolved,
        ] {
            let count = counts.get(&status).copied().unwrap_or(0);
            self.metrics
                .set_alerts_by_status(&status.to_string(), count as i64);
        }
        self.metrics.set_rules_loaded(snapshot.len() as i64);

        self.health.set_healthy(components::INGEST).await;
        self.health.set_healthy(components::DISPATCHER).await;
        if self.analyzer.has_provider() {
            self.health.set_healthy(components::ANALYZER).await;
        } else {
            self.health
                .set_degraded(components::ANALYZER, "AI provider not configured")
                .await;
        }

        debug!(
            evicted_series = evicted_series,
            pruned_alerts = pruned_alerts,
            tracked_groups = self.evaluator.tracked_groups(),
            "Maintenance pass complete"
        );
    }

    /// Run the scheduler, report consumer and maintenance loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        for component in [
            components::INGEST,
            components::EVALUATOR,
            components::DISPATCHER,
            components::ANALYZER,
        ] {
            self.health.register(component).await;
        }

        let (reports_tx, mut reports) = mpsc::channel(self.report_queue);
        let scheduler = Arc::new(
            EvaluationScheduler::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.evaluator),
                reports_tx,
                &self.scheduler,
            )
            .with_health(Arc::clone(&self.health)),
        );
        let scheduler_task = tokio::spawn(scheduler.run(shutdown.resubscribe()));

        let mut maintenance = tokio::time::interval(self.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.health.set_ready(true).await;
        info!(
            rules = self.registry.snapshot().len(),
            channels = self.dispatcher.channel_ids().len(),
            "Alert engine running"
        );

        loop {
            tokio::select! {
                report = reports.recv() => match report {
                    Some(report) => self.apply_report(report).await,
                    None => break,
                },
                _ = maintenance.tick() => self.maintain(Utc::now()).await,
                _ = shutdown.recv() => break,
            }
        }

        self.health.set_ready(false).await;
        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "Scheduler task ended abnormally");
        }
        info!("Alert engine stopped");
    }
}

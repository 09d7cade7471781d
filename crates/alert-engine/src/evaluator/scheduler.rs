//! Evaluation scheduler
//!
//! One ticker task reads the current rule snapshot every tick and dispatches
//! rules whose interval has elapsed onto a bounded worker pool. A rule that
//! is still running is skipped until its evaluation finishes.

use super::{EvaluationReport, RuleEvaluator};
use crate::health::{components, HealthRegistry};
use crate::models::chrono_duration;
use crate::observability::EngineMetrics;
use crate::rules::RuleRegistry;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_millis: u64,
    /// Maximum rules evaluated at the same time
    pub max_concurrent: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_millis: 1000,
            max_concurrent: 16,
        }
    }
}

pub struct EvaluationScheduler {
    registry: Arc<RuleRegistry>,
    evaluator: Arc<RuleEvaluator>,
    reports: mpsc::Sender<EvaluationReport>,
    pool: Arc<Semaphore>,
    running: Arc<DashSet<String>>,
    next_due: DashMap<String, DateTime<Utc>>,
    tick: Duration,
    metrics: EngineMetrics,
    health: Option<Arc<HealthRegistry>>,
}

impl EvaluationScheduler {
    pub fn new(
        registry: Arc<RuleRegistry>,
        evaluator: Arc<RuleEvaluator>,
        reports: mpsc::Sender<EvaluationReport>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            registry,
            evaluator,
            reports,
            pool: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            running: Arc::new(DashSet::new()),
            next_due: DashMap::new(),
            tick: Duration::from_millis(config.tick_millis.max(10)),
            metrics: EngineMetrics::new(),
            health: None,
        }
    }

    pub fn with_health(mut self, health: Arc<HealthRegistry>) -> Self {
        self.health = Some(health);
        self
    }

    /// Run until a shutdown signal arrives
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_ms = self.tick.as_millis() as u64, "Evaluation scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let dispatched = self.dispatch_due(Utc::now());
                    if dispatched > 0 {
                        debug!(rules = dispatched, "Dispatched rule evaluations");
                    }
                    if let Some(health) = &self.health {
                        health.set_healthy(components::EVALUATOR).await;
                    }
                }
                _ = shutdown.recv() => {
                    info!("Evaluation scheduler stopping");
                    break;
                }
            }
        }
    }

    /// Spawn evaluations for every enabled rule whose interval elapsed.
    ///
    /// Returns the number of evaluations started.
    pub fn dispatch_due(self: &Arc<Self>, now: DateTime<Utc>) -> usize {
        let snapshot = self.registry.snapshot();
        self.next_due.retain(|id, _| snapshot.contains(id));

        let mut dispatched = 0;
        for rule in snapshot.enabled() {
            let due = self
                .next_due
                .get(&rule.id)
                .map(|next| *next <= now)
                .unwrap_or(true);
            if !due || !self.running.insert(rule.id.clone()) {
                continue;
            }
            self.next_due
                .insert(rule.id.clone(), now + chrono_duration(rule.interval()));

            let rule = rule.clone();
            let scheduler = Arc::clone(self);
            tokio::spawn(async move {
                let permit = match scheduler.pool.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        scheduler.running.remove(&rule.id);
                        return;
                    }
                };

                let started = Instant::now();
                let report = scheduler.evaluator.evaluate(&rule, now).await;
                scheduler
                    .metrics
                    .observe_evaluation_latency(started.elapsed().as_secs_f64());
                drop(permit);
                scheduler.running.remove(&rule.id);

                if scheduler.reports.send(report).await.is_err() {
                    warn!(rule_id = %rule.id, "Evaluation report dropped, consumer closed");
                }
            });
            dispatched += 1;
        }
        dispatched
    }

    /// Rules currently being evaluated
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}

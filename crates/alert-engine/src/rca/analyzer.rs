//! Root-cause analysis orchestration
//!
//! Gathers the alert's own series, correlated series and knowledge hits,
//! asks the AI provider for ranked causes, and caches the result per
//! (fingerprint, context hash). Failures produce a degraded analysis
//! instead of an error so alert delivery is never held up.

use super::context::{context_hash, AnalysisContext, ContextBuilder};
use super::provider::{AiError, AiFinding, AiProvider};
use crate::error::{EngineError, EngineResult};
use crate::ingest::{IngestBuffer, SeriesKey, SeriesWindow};
use crate::knowledge::KnowledgeRetriever;
use crate::models::{Alert, AnalysisStatus, RootCauseAnalysis};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::rules::AlertRule;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Deadline for one provider call
    pub timeout_ms: u64,
    pub cache_ttl_secs: u64,
    /// Width of the value buckets in the context hash
    pub bucket_width: f64,
    pub knowledge_limit: usize,
    pub context_budget_bytes: usize,
    pub history_secs: u64,
    /// Labels used to find correlated series
    pub correlate_on: Vec<String>,
    pub max_correlated: usize,
    pub max_concurrent: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            cache_ttl_secs: 3600,
            bucket_width: 10.0,
            knowledge_limit: 5,
            context_budget_bytes: 16 * 1024,
            history_secs: 3600,
            correlate_on: vec![
                "host".to_string(),
                "service".to_string(),
                "instance".to_string(),
                "pod".to_string(),
            ],
            max_correlated: 20,
            max_concurrent: 4,
        }
    }
}

impl AnalyzerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

struct CacheSlot {
    created: Instant,
    cell: OnceCell<RootCauseAnalysis>,
}

impl CacheSlot {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            cell: OnceCell::new(),
        }
    }
}

type CacheKey = (String, String);

pub struct RootCauseAnalyzer {
    buffer: Arc<IngestBuffer>,
    provider: Option<Arc<dyn AiProvider>>,
    retriever: Option<Arc<KnowledgeRetriever>>,
    config: AnalyzerConfig,
    builder: ContextBuilder,
    cache: DashMap<CacheKey, Arc<CacheSlot>>,
    permits: Semaphore,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl RootCauseAnalyzer {
    pub fn new(buffer: Arc<IngestBuffer>, config: AnalyzerConfig, logger: StructuredLogger) -> Self {
        Self {
            buffer,
            provider: None,
            retriever: None,
            builder: ContextBuilder {
                budget_bytes: config.context_budget_bytes,
                ..Default::default()
            },
            permits: Semaphore::new(config.max_concurrent.max(1)),
            config,
            cache: DashMap::new(),
            logger,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn AiProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<KnowledgeRetriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn has_provider(&self) -> bool {
        self.provider.is_some()
    }

    /// Analyze a confirmed alert. At most one provider call is made per
    /// (fingerprint, context hash) within the cache TTL.
    pub async fn analyze(&self, alert: &Alert, rule: &AlertRule) -> EngineResult<RootCauseAnalysis> {
        if !alert.status.is_confirmed() {
            return Err(EngineError::AlertNotFiring(alert.id.clone()));
        }

        let group = rule.group_labels(&alert.labels);
        let hash = context_hash(&alert.rule_id, &group, alert.value, self.config.bucket_width);
        let slot = self.slot((alert.fingerprint.clone(), hash.clone()));

        let produced = AtomicBool::new(false);
        let result = slot
            .cell
            .get_or_try_init(|| async {
                produced.store(true, Ordering::SeqCst);
                let analysis = self.run(alert, rule, &hash).await;
                if analysis.unavailable {
                    Err(analysis)
                } else {
                    Ok(analysis)
                }
            })
            .await;

        let analysis = match result {
            Ok(cached) if !produced.load(Ordering::SeqCst) => {
                self.metrics.inc_ai_cache_hit();
                debug!(alert_id = %alert.id, context_hash = %hash, "Analysis served from cache");
                let mut analysis = cached.clone();
                analysis.alert_id = alert.id.clone();
                self.logger
                    .log_analysis(&alert.id, analysis.status, analysis.confidence, true, None);
                return Ok(analysis);
            }
            Ok(fresh) => fresh.clone(),
            Err(degraded) => degraded,
        };

        self.logger.log_analysis(
            &alert.id,
            analysis.status,
            analysis.confidence,
            false,
            analysis.unavailable_reason.as_deref(),
        );
        Ok(analysis)
    }

    fn slot(&self, key: CacheKey) -> Arc<CacheSlot> {
        let ttl = self.config.cache_ttl();
        let mut entry = self
            .cache
            .entry(key)
            .or_insert_with(|| Arc::new(CacheSlot::new()));
        if entry.created.elapsed() > ttl {
            *entry = Arc::new(CacheSlot::new());
        }
        Arc::clone(&entry)
    }

    async fn run(&self, alert: &Alert, rule: &AlertRule, hash: &str) -> RootCauseAnalysis {
        let Some(provider) = &self.provider else {
            return RootCauseAnalysis::unavailable(alert, hash, "none", "AI provider not configured");
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                return RootCauseAnalysis::unavailable(alert, hash, provider.model(), "analyzer shut down")
            }
        };

        let context = self.gather(alert, rule).await;
        let started = Instant::now();
        let result = self.call_with_retry(provider.as_ref(), &context).await;
        self.metrics
            .observe_analysis_latency(started.elapsed().as_secs_f64());

        match result {
            Ok(finding) => {
                self.metrics.inc_ai_call("success");
                completed(alert, hash, provider.model(), &context, finding)
            }
            Err(e) => {
                self.metrics.inc_ai_call("unavailable");
                RootCauseAnalysis::unavailable(alert, hash, provider.model(), e.to_string())
            }
        }
    }

    /// One retry on transient failures, each attempt under the deadline
    async fn call_with_retry(
        &self,
        provider: &dyn AiProvider,
        context: &AnalysisContext,
    ) -> Result<AiFinding, AiError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::time::timeout(self.config.timeout(), provider.analyze(context))
                .await
                .unwrap_or(Err(AiError::Timeout));
            match outcome {
                Err(e) if e.is_transient() && attempt < 2 => {
                    warn!(
                        alert_id = %context.alert.id,
                        provider = %provider.name(),
                        error = %e,
                        "AI call failed, retrying once"
                    );
                }
                other => return other,
            }
        }
    }

    async fn gather(&self, alert: &Alert, rule: &AlertRule) -> AnalysisContext {
        let now = Utc::now();
        let window = Duration::from_secs(self.config.history_secs);

        let mut matchers = rule.selector.matchers.clone();
        matchers.extend(rule.group_labels(&alert.labels));

        let mut metrics: Vec<&str> = rule
            .conditions
            .iter()
            .map(|condition| rule.condition_metric(condition))
            .collect();
        metrics.sort_unstable();
        metrics.dedup();

        let own: Vec<SeriesKey> = metrics
            .iter()
            .flat_map(|metric| self.buffer.select(metric, &matchers))
            .collect();
        let own_set: HashSet<&SeriesKey> = own.iter().collect();

        let history: Vec<SeriesWindow> = own
            .iter()
            .map(|key| self.buffer.window(key, window, now))
            .filter(|w| !w.is_empty())
            .collect();

        let correlated: Vec<SeriesWindow> = self
            .buffer
            .correlated(&alert.labels, &self.config.correlate_on)
            .iter()
            .filter(|key| !own_set.contains(key))
            .map(|key| self.buffer.window(key, window, now))
            .filter(|w| !w.is_empty())
            .take(self.config.max_correlated)
            .collect();

        let knowledge = match &self.retriever {
            Some(retriever) => {
                let query = knowledge_query(alert, rule);
                retriever
                    .search(&query, &alert.labels, self.config.knowledge_limit)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(alert_id = %alert.id, error = %e, "Knowledge search failed");
                        Vec::new()
                    })
            }
            None => Vec::new(),
        };

        let description = Some(rule.description.clone()).filter(|d| !d.is_empty());
        self.builder
            .build(alert, description, &history, &correlated, &knowledge)
    }

    /// Drop expired cache slots. Returns the count removed.
    pub fn prune(&self) -> usize {
        let ttl = self.config.cache_ttl();
        let before = self.cache.len();
        self.cache.retain(|_, slot| slot.created.elapsed() <= ttl);
        before - self.cache.len()
    }

    pub fn cached_entries(&self) -> usize {
        self.cache
            .iter()
            .filter(|slot| slot.cell.initialized())
            .count()
    }
}

fn knowledge_query(alert: &Alert, rule: &AlertRule) -> String {
    let mut query = format!("{} {}", rule.name, rule.description);
    for (name, value) in &alert.labels {
        if name != "alertname" {
            query.push(' ');
            query.push_str(value);
        }
    }
    query
}

fn completed(
    alert: &Alert,
    hash: &str,
    model: &str,
    context: &AnalysisContext,
    finding: AiFinding,
) -> RootCauseAnalysis {
    let offered: Vec<String> = context.knowledge.iter().map(|k| k.id.clone()).collect();
    let cited: Vec<String> = finding
        .knowledge_refs
        .into_iter()
        .filter(|id| offered.contains(id))
        .collect();
    let knowledge_refs = if cited.is_empty() { offered } else { cited };

    let status = if finding.causes.is_empty() {
        AnalysisStatus::NoCauseFound
    } else {
        AnalysisStatus::Completed
    };

    RootCauseAnalysis {
        alert_id: alert.id.clone(),
        fingerprint: alert.fingerprint.clone(),
        context_hash: hash.to_string(),
        status,
        causes: finding.causes,
        evidence: finding.evidence,
        recommendations: finding.recommendations,
        knowledge_refs,
        confidence: finding.confidence,
        model: model.to_string(),
        unavailable: false,
        unavailable_reason: None,
        generated_at: Utc::now(),
    }
}

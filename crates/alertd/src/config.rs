//! Daemon configuration

use alert_engine::aggregator::{AggregationRule, AggregatorConfig};
use alert_engine::anomaly::DetectorKind;
use alert_engine::evaluator::{EvaluatorConfig, SchedulerConfig};
use alert_engine::ingest::BufferConfig;
use alert_engine::notify::{ChannelSpec, DispatcherConfig, EscalationPolicy};
use alert_engine::rca::{AnalyzerConfig, ProviderConfig};
use alert_engine::EngineConfig;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file used when `ALERTD_CONFIG` is not set
pub const DEFAULT_CONFIG_PATH: &str = "/etc/alertd/alertd.yaml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferSection {
    pub capacity_per_series: usize,
    pub retention_secs: u64,
    pub max_series: usize,
}

impl Default for BufferSection {
    fn default() -> Self {
        let defaults = BufferConfig::default();
        Self {
            capacity_per_series: defaults.capacity_per_series,
            retention_secs: defaults.retention.as_secs(),
            max_series: defaults.max_series,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AiSection {
    pub provider: ProviderConfig,
    pub analyzer: AnalyzerConfig,
}

/// alertd configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Name reported in logs
    pub node_name: String,

    /// Port for the HTTP API, health and metrics
    pub api_port: u16,

    /// Rule file, watched for changes
    pub rules_path: Option<PathBuf>,

    /// Knowledge base JSON file
    pub knowledge_path: Option<PathBuf>,

    /// Alert state file; state is kept in memory only when unset
    pub persistence_path: Option<PathBuf>,

    pub buffer: BufferSection,
    pub detector: DetectorKind,
    pub evaluator: EvaluatorConfig,
    pub scheduler: SchedulerConfig,
    pub aggregator: AggregatorConfig,
    pub dispatcher: DispatcherConfig,
    pub channels: Vec<ChannelSpec>,
    pub escalation_policies: Vec<EscalationPolicy>,
    pub aggregation_rules: Vec<AggregationRule>,
    pub ai: AiSection,

    pub maintenance_interval_secs: u64,

    /// Time allowed for in-flight work after a shutdown signal
    pub shutdown_grace_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "alertd".to_string())
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node_name: default_node_name(),
            api_port: 8080,
            rules_path: None,
            knowledge_path: None,
            persistence_path: None,
            buffer: BufferSection::default(),
            detector: DetectorKind::default(),
            evaluator: EvaluatorConfig::default(),
            scheduler: SchedulerConfig::default(),
            aggregator: AggregatorConfig::default(),
            dispatcher: DispatcherConfig::default(),
            channels: Vec::new(),
            escalation_policies: Vec::new(),
            aggregation_rules: Vec::new(),
            ai: AiSection::default(),
            maintenance_interval_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl DaemonConfig {
    /// Load from `ALERTD_CONFIG` (or the default path) and `ALERTD_*` variables
    pub fn load() -> Result<Self> {
        let path = std::env::var("ALERTD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Some(Path::new(&path)))
    }

    /// Optional file layered under the environment
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("ALERTD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read alertd configuration")?
            .try_deserialize()
            .context("Invalid alertd configuration")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            node_name: self.node_name.clone(),
            buffer: BufferConfig {
                capacity_per_series: self.buffer.capacity_per_series,
                retention: Duration::from_secs(self.buffer.retention_secs),
                max_series: self.buffer.max_series,
            },
            detector: self.detector,
            evaluator: self.evaluator.clone(),
            scheduler: self.scheduler.clone(),
            aggregator: self.aggregator.clone(),
            dispatcher: self.dispatcher.clone(),
            analyzer: self.ai.analyzer.clone(),
            maintenance_interval: Duration::from_secs(self.maintenance_interval_secs.max(1)),
            ..EngineConfig::default()
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Per-attempt deadline handed to channels
    pub fn channel_timeout(&self) -> Duration {
        self.dispatcher.retry.attempt_timeout()
    }
}

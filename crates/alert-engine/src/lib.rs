//! Alerting and root-cause analysis engine
//!
//! This crate provides the core functionality for:
//! - Buffering metric samples per series
//! - Static, dynamic and anomaly-scored thresholds
//! - Scheduled rule evaluation with for-duration semantics
//! - Alert deduplication, lifecycle and aggregation
//! - Notification dispatch with escalation and retries
//! - AI-assisted root-cause analysis grounded in a knowledge base
//! - Health checks and observability

pub mod aggregator;
pub mod anomaly;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod health;
pub mod ingest;
pub mod knowledge;
pub mod models;
pub mod notify;
pub mod observability;
pub mod persistence;
pub mod rca;
pub mod rules;
pub mod threshold;

pub use engine::{AlertEngine, AlertEngineBuilder, EngineConfig, IngestSummary};
pub use error::{EngineError, EngineResult};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{EngineMetrics, StructuredLogger};

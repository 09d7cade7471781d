//! alertd - intelligent alerting daemon
//!
//! Ingests metric samples over HTTP, evaluates alert rules, dispatches
//! notifications with escalation and attaches AI root-cause analyses.

use alert_engine::{
    health::components,
    knowledge::{HashingEmbedder, InMemoryKnowledgeStore, KnowledgeRetriever},
    notify::build_channel,
    persistence::JsonFileRepository,
    rca::HttpAiProvider,
    rules::{reload_rules, RuleRegistry, RuleWatcher},
    AlertEngine, HealthRegistry,
};
use alertd::{api, config::DaemonConfig};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting alertd");

    let config = DaemonConfig::load()?;
    info!(node_name = %config.node_name, port = config.api_port, "Daemon configured");

    let health = Arc::new(HealthRegistry::new());
    health.register(components::RULES).await;

    let registry = Arc::new(RuleRegistry::new());
    if let Some(path) = &config.rules_path {
        match reload_rules(path, &registry) {
            Ok(count) => {
                info!(path = %path.display(), rules = count, "Rules loaded");
                health.set_healthy(components::RULES).await;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Initial rule load failed");
                health
                    .set_degraded(components::RULES, e.to_string())
                    .await;
            }
        }
    } else {
        health.set_healthy(components::RULES).await;
    }

    let mut builder = AlertEngine::builder(config.engine_config())
        .registry(Arc::clone(&registry))
        .health(Arc::clone(&health))
        .aggregation(config.aggregation_rules.clone());

    for spec in &config.channels {
        match build_channel(spec, config.channel_timeout()) {
            Ok(channel) => builder = builder.channel(channel, spec.rate_limit.clone()),
            Err(e) => warn!(channel = %spec.id, error = %e, "Skipping misconfigured channel"),
        }
    }
    for policy in &config.escalation_policies {
        builder = builder.policy(policy.clone());
    }

    if config.ai.provider.enabled {
        match HttpAiProvider::from_config(&config.ai.provider) {
            Ok(provider) => builder = builder.provider(Arc::new(provider)),
            Err(e) => warn!(error = %e, "AI provider disabled"),
        }
    }

    if let Some(path) = &config.knowledge_path {
        let embedder = Arc::new(HashingEmbedder::default());
        match InMemoryKnowledgeStore::load_json(path, embedder.as_ref()) {
            Ok(store) => {
                builder = builder.retriever(Arc::new(KnowledgeRetriever::new(
                    Arc::new(store),
                    embedder,
                )));
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Knowledge base unavailable"),
        }
    }

    if let Some(path) = &config.persistence_path {
        let repository = JsonFileRepository::open(path)
            .await
            .with_context(|| format!("Failed to open alert state at {}", path.display()))?;
        builder = builder.repository(Arc::new(repository));
    }

    let engine = builder.build();
    engine.restore().await?;
    engine
        .logger()
        .log_startup(DAEMON_VERSION, registry.snapshot().len(), engine.channel_ids().len());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let _watcher = match &config.rules_path {
        Some(path) => Some(
            RuleWatcher::new(path, Arc::clone(&registry), engine.logger().clone()).start()?,
        ),
        None => None,
    };

    let engine_handle = tokio::spawn(Arc::clone(&engine).run(shutdown_tx.subscribe()));

    let app_state = Arc::new(api::AppState::new(Arc::clone(&engine)));
    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    let reason = wait_for_signal().await?;
    engine.logger().log_shutdown(reason);
    let _ = shutdown_tx.send(());

    let drain = async {
        if let Err(e) = engine_handle.await {
            error!(error = %e, "Engine task panicked");
        }
        match api_handle.await {
            Ok(Err(e)) => error!(error = %e, "API server failed"),
            Err(e) => error!(error = %e, "API task panicked"),
            Ok(Ok(())) => {}
        }
    };
    if tokio::time::timeout(config.shutdown_grace(), drain).await.is_err() {
        warn!(
            grace_secs = config.shutdown_grace_secs,
            "Shutdown grace period elapsed"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            Ok("SIGINT received")
        }
        _ = terminate.recv() => Ok("SIGTERM received"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("SIGINT received")
}

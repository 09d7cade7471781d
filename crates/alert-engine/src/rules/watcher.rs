//! Rule file watcher for hot reload

use super::registry::{load_rules_file, RuleRegistry};
use crate::error::EngineResult;
use crate::observability::StructuredLogger;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Quiet period after a filesystem event before reloading
const DEBOUNCE: Duration = Duration::from_millis(200);

/// Load the rule file and swap it into the registry
pub fn reload_rules(path: &Path, registry: &RuleRegistry) -> EngineResult<usize> {
    let rules = load_rules_file(path)?;
    registry.replace_all(rules)
}

/// Watches a rule file and reloads the registry when it changes
pub struct RuleWatcher {
    path: PathBuf,
    registry: Arc<RuleRegistry>,
    logger: StructuredLogger,
}

impl RuleWatcher {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<RuleRegistry>, logger: StructuredLogger) -> Self {
        Self {
            path: path.into(),
            registry,
            logger,
        }
    }

    /// Start watching. Returns a handle that stops watching when dropped.
    pub fn start(self) -> Result<WatcherHandle> {
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            notify::Config::default(),
        )
        .context("Failed to create filesystem watcher")?;

        // Editors replace files by rename, so watch the directory
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {}", dir.display()))?;

        let file_name = self.path.file_name().map(|n| n.to_os_string());
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !is_relevant(&event, file_name.as_deref()) {
                    continue;
                }

                // Coalesce bursts of writes into one reload
                tokio::time::sleep(DEBOUNCE).await;
                while rx.try_recv().is_ok() {}

                let source = self.path.display().to_string();
                match reload_rules(&self.path, &self.registry) {
                    Ok(count) => self.logger.log_rules_reloaded(&source, count, None),
                    Err(e) => {
                        warn!(path = %source, error = %e, "Keeping previous rules");
                        self.logger.log_rules_reloaded(&source, 0, Some(&e.to_string()));
                    }
                }
            }
            debug!("Rule watcher channel closed");
        });

        Ok(WatcherHandle {
            _watcher: watcher,
            task,
        })
    }
}

fn is_relevant(event: &Event, file_name: Option<&std::ffi::OsStr>) -> bool {
    let kind_matches = matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Any
    );
    kind_matches
        && event
            .paths
            .iter()
            .any(|p| file_name.map(|name| p.file_name() == Some(name)).unwrap_or(true))
}

/// Handle to a running watcher
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule_json(id: &str, threshold: f64) -> String {
        format!(
            r#"{{"rules": [{{
                "id": "{}",
                "name": "HighCpu",
                "selector": {{"metric": "cpu_usage_percent"}},
                "conditions": [{{"operator": "gt", "threshold": {{"type": "static", "value": {}}}}}]
            }}]}}"#,
            id, threshold
        )
    }

    #[test]
    fn test_reload_rules_replaces_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, rule_json("cpu-high", 80.0)).unwrap();

        let registry = RuleRegistry::new();
        assert_eq!(reload_rules(&path, &registry).unwrap(), 1);
        assert!(registry.get("cpu-high").is_some());

        std::fs::write(&path, "{\"rules\": [{\"id\": \"broken\"}]}").unwrap();
        assert!(reload_rules(&path, &registry).is_err());
        // Previous rules stay active
        assert!(registry.get("cpu-high").is_some());
    }

    #[tokio::test]
    async fn test_watcher_picks_up_changes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, rule_json("first", 80.0)).unwrap();

        let registry = Arc::new(RuleRegistry::new());
        reload_rules(&path, &registry).unwrap();

        let _handle = RuleWatcher::new(&path, registry.clone(), StructuredLogger::new("test"))
            .start()
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&path, rule_json("second", 90.0)).unwrap();

        let reloaded = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                if registry.get("second").is_some() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        assert!(reloaded.is_ok(), "watcher did not reload rules");
        assert!(registry.get("first").is_none());
    }
}

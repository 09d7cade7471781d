//! Alert and analysis persistence
//!
//! The engine keeps its working state in memory and writes through to an
//! `AlertRepository` so alerts survive a restart.

use crate::error::{EngineError, EngineResult};
use crate::models::{Alert, AlertStatus, RootCauseAnalysis};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

#[async_trait]
pub trait AlertRepository: Send + Sync {
    async fn save_alert(&self, alert: &Alert) -> EngineResult<()>;

    async fn save_analysis(&self, analysis: &RootCauseAnalysis) -> EngineResult<()>;

    /// Forget an alert that never confirmed
    async fn delete_alert(&self, _id: &str) -> EngineResult<()> {
        Ok(())
    }

    async fn load_alerts(&self) -> EngineResult<Vec<Alert>>;

    async fn load_analyses(&self) -> EngineResult<Vec<RootCauseAnalysis>>;

    /// Drop alerts resolved before `before`, with their analyses
    async fn prune(&self, _before: DateTime<Utc>) -> EngineResult<usize> {
        Ok(0)
    }
}

/// Keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRepository;

#[async_trait]
impl AlertRepository for NoopRepository {
    async fn save_alert(&self, _alert: &Alert) -> EngineResult<()> {
        Ok(())
    }

    async fn save_analysis(&self, _analysis: &RootCauseAnalysis) -> EngineResult<()> {
        Ok(())
    }

    async fn load_alerts(&self) -> EngineResult<Vec<Alert>> {
        Ok(Vec::new())
    }

    async fn load_analyses(&self) -> EngineResult<Vec<RootCauseAnalysis>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    alerts: BTreeMap<String, Alert>,
    #[serde(default)]
    analyses: BTreeMap<String, RootCauseAnalysis>,
}

/// Whole state in one JSON file, rewritten atomically on every change
pub struct JsonFileRepository {
    path: PathBuf,
    state: Mutex<Snapshot>,
}

fn persistence_error(e: anyhow::Error) -> EngineError {
    EngineError::Persistence(format!("{:#}", e))
}

impl JsonFileRepository {
    /// Open the file at `path`, starting empty if it does not exist yet
    pub async fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let state = if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))
                .map_err(persistence_error)?;
            let snapshot: Snapshot = serde_json::from_slice(&data)
                .with_context(|| format!("Failed to parse {}", path.display()))
                .map_err(persistence_error)?;
            info!(
                path = %path.display(),
                alerts = snapshot.alerts.len(),
                analyses = snapshot.analyses.len(),
                "Loaded persisted alert state"
            );
            snapshot
        } else {
            Snapshot::default()
        };

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn write(&self, snapshot: &Snapshot) -> EngineResult<()> {
        self.write_inner(snapshot).await.map_err(persistence_error)
    }

    async fn write_inner(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let json = serde_json::to_vec(snapshot).context("Failed to serialize alert state")?;
        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file {}", temp_path.display()))?;
        file.write_all(&json)
            .await
            .context("Failed to write alert state")?;
        file.sync_all().await.context("Failed to sync alert state")?;

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .with_context(|| {
                format!(
                    "Failed to rename {} to {}",
                    temp_path.display(),
                    self.path.display()
                )
            })?;

        debug!(path = %self.path.display(), bytes = json.len(), "Alert state written");
        Ok(())
    }
}

#[async_trait]
impl AlertRepository for JsonFileRepository {
    async fn save_alert(&self, alert: &Alert) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state.alerts.insert(alert.id.clone(), alert.clone());
        self.write(&state).await
    }

    async fn save_analysis(&self, analysis: &RootCauseAnalysis) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        state
            .analyses
            .insert(analysis.alert_id.clone(), analysis.clone());
        self.write(&state).await
    }

    async fn delete_alert(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().await;
        if state.alerts.remove(id).is_none() {
            return Ok(());
        }
        state.analyses.remove(id);
        self.write(&state).await
    }

    async fn load_alerts(&self) -> EngineResult<Vec<Alert>> {
        Ok(self.state.lock().await.alerts.values().cloned().collect())
    }

    async fn load_analyses(&self) -> EngineResult<Vec<RootCauseAnalysis>> {
        Ok(self.state.lock().await.analyses.values().cloned().collect())
    }

    async fn prune(&self, before: DateTime<Utc>) -> EngineResult<usize> {
        let mut state = self.state.lock().await;
        let expired: Vec<String> = state
            .alerts
            .values()
            .filter(|a| a.status == AlertStatus::Resolved && a.ends_at.map(|t| t < before).unwrap_or(false))
            .map(|a| a.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }
        for id in &expired {
            state.alerts.remove(id);
            state.analyses.remove(id);
        }
        self.write(&state).await?;
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Severity, Threshold};

    fn alert(id: &str, status: AlertStatus, ends_at: Option<DateTime<Utc>>) -> Alert {
        Alert {
            id: id.into(),
            rule_id: "R1".into(),
            rule_name: "HighCpu".into(),
            fingerprint: format!("fp-{}", id),
            status,
            severity: Severity::Warning,
            labels: Default::default(),
            annotations: Default::default(),
            value: 90.0,
            threshold: Threshold::default(),
            pending_since: None,
            starts_at: Some(Utc::now()),
            ends_at,
            updated_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            reopen_count: 0,
            related_to: None,
        }
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("alerts.json");

        let repo = JsonFileRepository::open(&path).await.unwrap();
        repo.save_alert(&alert("a1", AlertStatus::Firing, None)).await.unwrap();
        let mut updated = alert("a1", AlertStatus::Acknowledged, None);
        updated.acknowledged_by = Some("oncall".into());
        repo.save_alert(&updated).await.unwrap();
        repo.save_analysis(&RootCauseAnalysis::unavailable(&updated, "h", "m", "timeout"))
            .await
            .unwrap();

        let reopened = JsonFileRepository::open(&path).await.unwrap();
        let alerts = reopened.load_alerts().await.unwrap();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].status, AlertStatus::Acknowledged);
        assert_eq!(reopened.load_analyses().await.unwrap().len(), 1);
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_prune_drops_old_resolved_alerts() {
        let dir = tempfile::tempdir().unwrap();
        let repo = JsonFileRepository::open(dir.path().join("alerts.json")).await.unwrap();
        let now = Utc::now();

        repo.save_alert(&alert("old", AlertStatus::Resolved, Some(now - chrono::Duration::days(2))))
            .await
            .unwrap();
        repo.save_alert(&alert("recent", AlertStatus::Resolved, Some(now))).await.unwrap();
        repo.save_alert(&alert("live", AlertStatus::Firing, None)).await.unwrap();

        let removed = repo.prune(now - chrono::Duration::days(1)).await.unwrap();
        assert_eq!(removed, 1);
        repo.save_alert(&alert("cancelled", AlertStatus::Pending, None)).await.unwrap();
        repo.delete_alert("cancelled").await.unwrap();
        let mut ids: Vec<String> = repo.load_alerts().await.unwrap().into_iter().map(|a| a.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["live", "recent"]);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.json");
        std::fs::write(&path, b"{not json").unwrap();

        let result = JsonFileRepository::open(&path).await;
        assert!(matches!(result, Err(EngineError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_noop_repository() {
        let repo = NoopRepository;
        repo.save_alert(&alert("a1", AlertStatus::Firing, None)).await.unwrap();
        assert!(repo.load_alerts().await.unwrap().is_empty());
        assert_eq!(repo.prune(Utc::now()).await.unwrap(), 0);
    }
}

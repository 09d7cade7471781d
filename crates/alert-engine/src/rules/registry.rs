//! Rule registry with atomically swapped snapshots
//!
//! Readers take an immutable `RuleSet` snapshot per tick; writers build a new
//! set and swap it in, so a reload never tears an in-flight evaluation.

use super::AlertRule;
use crate::error::{EngineError, EngineResult};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Immutable set of rules at one version
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: BTreeMap<String, Arc<AlertRule>>,
    version: u64,
}

impl RuleSet {
    pub fn get(&self, id: &str) -> Option<&Arc<AlertRule>> {
        self.rules.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AlertRule>> + '_ {
        self.rules.values()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &Arc<AlertRule>> + '_ {
        self.rules.values().filter(|r| r.enabled)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rules.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// On-disk rule file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    #[serde(default)]
    pub rules: Vec<AlertRule>,
}

/// Hot-reloadable rule store
pub struct RuleRegistry {
    current: ArcSwap<RuleSet>,
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RuleSet::default()),
        }
    }

    /// Current snapshot; stays valid even if the registry is reloaded
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.current.load_full()
    }

    pub fn get(&self, id: &str) -> Option<Arc<AlertRule>> {
        self.current.load().get(id).cloned()
    }

    /// Replace every rule. The whole set is rejected if any rule is invalid.
    pub fn replace_all(&self, rules: Vec<AlertRule>) -> EngineResult<usize> {
        let mut map = BTreeMap::new();
        for rule in rules {
            rule.validate()?;
            if map.contains_key(&rule.id) {
                return Err(EngineError::invalid_rule(&rule.id, "duplicate rule id"));
            }
            map.insert(rule.id.clone(), Arc::new(rule));
        }

        let count = map.len();
        self.current.rcu(|current| RuleSet {
            rules: map.clone(),
            version: current.version + 1,
        });
        Ok(count)
    }

    /// Insert or replace one rule. Returns true if the rule was new.
    pub fn upsert(&self, rule: AlertRule) -> EngineResult<bool> {
        rule.validate()?;
        let rule = Arc::new(rule);
        let mut created = false;

        self.current.rcu(|current| {
            let mut next = RuleSet::clone(current);
            created = next
                .rules
                .insert(rule.id.clone(), rule.clone())
                .is_none();
            next.version += 1;
            next
        });
        Ok(created)
    }

    /// Remove a rule. Returns true if it existed.
    pub fn remove(&self, id: &str) -> bool {
        let mut removed = false;
        self.current.rcu(|current| {
            let mut next = RuleSet::clone(current);
            removed = next.rules.remove(id).is_some();
            if removed {
                next.version += 1;
            }
            next
        });
        removed
    }
}

/// Parse a YAML, TOML or JSON rule file (format chosen by extension)
pub fn load_rules_file(path: &Path) -> EngineResult<Vec<AlertRule>> {
    let source = path.display().to_string();
    let settings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(|e| EngineError::invalid_rule(&source, e.to_string()))?;

    let file: RuleFile = settings
        .try_deserialize()
        .map_err(|e| EngineError::invalid_rule(&source, e.to_string()))?;
    Ok(file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::definition::fixtures::cpu_rule;
    use std::io::Write;

    #[test]
    fn test_upsert_and_remove_bump_version() {
        let registry = RuleRegistry::new();
        let before = registry.snapshot();

        assert!(registry.upsert(cpu_rule()).unwrap());
        assert!(!registry.upsert(cpu_rule()).unwrap());
        assert_eq!(registry.snapshot().version(), 2);
        assert_eq!(registry.snapshot().len(), 1);

        // Earlier snapshots are unaffected
        assert!(before.is_empty());

        assert!(registry.remove("R1"));
        assert!(!registry.remove("R1"));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_invalid_rule_never_reaches_registry() {
        let registry = RuleRegistry::new();
        let mut rule = cpu_rule();
        rule.conditions.clear();

        assert!(matches!(
            registry.upsert(rule),
            Err(EngineError::InvalidRuleDefinition { .. })
        ));
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_replace_all_is_all_or_nothing() {
        let registry = RuleRegistry::new();
        registry.upsert(cpu_rule()).unwrap();

        let mut second = cpu_rule();
        second.id = "R2".to_string();
        let mut broken = cpu_rule();
        broken.id = "R3".to_string();
        broken.interval_secs = 0;

        assert!(registry.replace_all(vec![second.clone(), broken]).is_err());
        assert!(registry.get("R1").is_some());

        assert!(registry
            .replace_all(vec![second.clone(), second.clone()])
            .is_err());

        assert_eq!(registry.replace_all(vec![second]).unwrap(), 1);
        assert!(registry.get("R1").is_none());
        assert!(registry.get("R2").is_some());
    }

    #[test]
    fn test_load_rules_from_json_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("rules.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"rules": [{{
                "id": "disk-full",
                "name": "DiskFull",
                "selector": {{"metric": "disk_used_percent"}},
                "conditions": [{{"operator": "gte", "threshold": {{"type": "static", "value": 90}}}}],
                "group_by": ["host", "mount"],
                "for_secs": 120
            }}]}}"#
        )
        .unwrap();

        let rules = load_rules_file(&path).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].group_by, vec!["host", "mount"]);
        assert_eq!(rules[0].for_secs, 120);
        assert!(rules[0].validate().is_ok());
    }

    #[test]
    fn test_load_rules_missing_file_is_error() {
        let err = load_rules_file(Path::new("/nonexistent/rules.yaml")).unwrap_err();
        assert!(matches!(err, EngineError::InvalidRuleDefinition { .. }));
    }
}

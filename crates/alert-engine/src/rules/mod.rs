//! Alert rules
//!
//! Rule definitions, validation, a snapshot-swapping registry and a file
//! watcher for hot reload.

mod definition;
mod registry;
mod watcher;

pub use definition::{
    AlertRule, BaselineMethod, Condition, ConditionLogic, MetricSelector, Operator, RuleActions,
    ThresholdSpec,
};
pub use registry::{load_rules_file, RuleFile, RuleRegistry, RuleSet};
pub use watcher::{reload_rules, RuleWatcher, WatcherHandle};

#[cfg(test)]
pub(crate) use definition::fixtures;

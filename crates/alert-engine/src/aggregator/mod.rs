//! Alert aggregation and deduplication
//!
//! Turns evaluator signals into persistent alerts, one active alert per
//! fingerprint, and derives the aggregated view used for notification
//! folding.

mod grouping;
mod identity;
mod store;

pub use grouping::{aggregate, group_of, AggregatedAlert, AggregationRule};
pub use identity::{fingerprint, shard_index};
pub use store::{
    AdmitOutcome, Admission, AggregatorConfig, AlertAggregator, ClearOutcome, ReopenPolicy,
};

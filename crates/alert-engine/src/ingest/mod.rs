//! Metric ingestion
//!
//! Producers append samples to bounded per-series rings; evaluation and
//! analysis read immutable window snapshots.

mod buffer;

pub use buffer::{BufferConfig, BufferStats, IngestBuffer, Sample, SeriesKey, SeriesWindow};

//! Threshold and baseline calculation
//!
//! Static thresholds are constants; dynamic thresholds are recomputed every
//! evaluation from the series window; AI thresholds delegate to the anomaly
//! detector and yield a score instead of bounds.

mod calculator;
mod stats;

pub use calculator::ThresholdCalculator;
pub use stats::{seasonal_factor, WindowStats};

//! alertd: alerting daemon around the alert engine

pub mod api;
pub mod config;

pub mod alerts;
pub mod ops;
pub mod rules;

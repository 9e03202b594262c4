//! Observability: structured logging and derived metrics.

pub mod metrics;
pub mod telemetry;

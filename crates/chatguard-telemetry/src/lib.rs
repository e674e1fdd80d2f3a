//! ChatGuard Telemetry
//!
//! Provides:
//! - In-process pipeline counters for the stats endpoint
//! - Prometheus metric names and descriptions

pub mod metrics;

pub use crate::metrics::{describe_metrics, names, MetricsSnapshot, PipelineMetrics};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::metrics::{MetricsSnapshot, PipelineMetrics};
}

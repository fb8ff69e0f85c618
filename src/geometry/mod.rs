//! Geometric measures and sizing metrics.

pub mod metric;
pub mod quality;

pub use metric::{Metric, MetricKind};
pub use quality::QualitySummary;

//! Operations: metrics and telemetry.

pub mod observability;
pub mod telemetry;

pub use observability::{MetricsHandle, MetricsRegistry, MetricsSnapshot};
pub use telemetry::Telemetry;

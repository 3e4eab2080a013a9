//! Logging and process counters for the gateway.
//!
//! `init_logging` wires tracing-subscriber with an `EnvFilter` and optional
//! daily-rotating file output. `GatewayMetrics` is a set of atomic counters
//! the components bump; a heartbeat task logs a snapshot periodically so an
//! operator can follow throughput without any external exporter.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::{GatewayMetrics, MetricsSnapshot};

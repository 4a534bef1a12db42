//! Logging setup and in-process metrics for the auto-claude services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: labelled counters and gauges plus duration histograms,
//!   exportable in Prometheus text format

pub mod logging;
pub mod metrics;

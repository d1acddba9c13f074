//! Logging and metrics for greekd
//!
//! - [`logging`] - the global `tracing` subscriber
//! - [`metrics`] - the Prometheus exporter and one metric handle per
//!   pipeline stage ([`SessionMetrics`], [`NormalizerMetrics`], [`WriterMetrics`])
//!
//! ```ignore
//! observability::init_logging("greekd", observability::LogFormat::Json)?;
//! observability::init_metrics("0.0.0.0:9100")?;
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, DEFAULT_FILTER};
pub use metrics::{init_metrics, NormalizerMetrics, SessionMetrics, WriterMetrics};

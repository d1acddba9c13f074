//! Resilient batch writer
//!
//! Persists canonical greek snapshots in batches and rides out store
//! outages behind a circuit breaker:
//!
//! - [`writer`] - The writer task: batching, spill and ordered replay
//! - [`breaker`] - CLOSED / OPEN / HALF_OPEN state machine
//! - [`probe`] - Periodic store health check while the circuit is open
//! - [`latency`] - Rolling p95 of persist latency against the target

pub mod breaker;
pub mod error;
pub mod latency;
pub mod probe;
pub mod writer;

pub use breaker::CircuitBreaker;
pub use error::{Result, WriterError};
pub use latency::{LatencyTracker, SloChange};
pub use probe::HealthProbe;
pub use writer::{invalid_reason, BatchWriter, WriterSettings};

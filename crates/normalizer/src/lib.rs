//! Normalization processor for greekstream
//!
//! Consumes the shared inbound channel and converts each raw payload into
//! exactly zero or one canonical [`GreekSnapshot`](common::GreekSnapshot).
//!
//! - [`mapping`] - Pure per-source field mappings
//! - [`dedup`] - Duplicate and out-of-order tracking per contract
//! - [`processor`] - The consumer task

pub mod dedup;
pub mod error;
pub mod mapping;
pub mod processor;

pub use dedup::{DedupTracker, Verdict};
pub use error::{NormalizeError, Result};
pub use mapping::{map_ibkr, map_payload, map_tastytrade, PartialSnapshot};
pub use processor::NormalizationProcessor;

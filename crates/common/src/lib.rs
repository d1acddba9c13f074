//! Common types for greekstream
//!
//! This crate provides the domain types shared by every pipeline stage.
//!
//! # Modules
//!
//! - [`clock`] - Injectable wall clock
//! - [`error`] - Common error types
//! - [`types`] - Sources, instruments, contract keys and `GreekSnapshot`
//! - [`payload`] - Per-source raw payloads as they leave a stream session
//! - [`subscription`] - Subscription sets pushed by the position collaborator
//! - [`status`] - Runtime status snapshots exposed to operators

pub mod clock;
pub mod error;
pub mod payload;
pub mod status;
pub mod subscription;
pub mod types;

pub use clock::{Clock, SystemClock, TokioClock};
pub use error::{Error, Result};
pub use payload::{DxGreeksEvent, IbkrMarketData, InboundMessage, RawPayload};
pub use status::{
    CircuitState, NormalizerStats, OverallHealth, PipelineStatus, SessionSnapshot, SessionState,
    StatusBoard, SupervisorStatus, WriterStatus,
};
pub use subscription::{Subscription, SubscriptionDiff, SubscriptionHandle, SubscriptionSet};
pub use types::*;

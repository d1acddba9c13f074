//! Brokerage stream sessions for greekstream
//!
//! Each brokerage feed runs as an independent [`StreamSession`] task under a
//! [`StreamSupervisor`]. Sessions connect, authenticate, subscribe and keep
//! their transport alive; everything they read is pushed onto one shared,
//! bounded inbound channel without ever stalling the read loop.
//!
//! # Architecture
//!
//! The reconnect state machine is written once, generic over the
//! [`FeedTransport`] trait. Only the wire protocol differs per source:
//!
//! - [`TastytradeTransport`] speaks DXLink (setup, auth, FEED channel)
//! - [`IbkrTransport`] speaks the Client Portal websocket topics
//!
//! Shutdown is cooperative through a shared `CancellationToken`.
//!
//! # Modules
//!
//! - [`session`] - Per-source state machine and heartbeat supervision
//! - [`supervisor`] - Spawns sessions, owns the inbound channel
//! - [`backoff`] - Reconnect delay schedule
//! - [`maintenance`] - Daily maintenance windows
//! - [`inbound`] - Backpressure-aware channel sender
//! - [`transport`] - The `FeedTransport` seam
//! - [`tastytrade`] / [`ibkr`] - Source protocols

pub mod backoff;
pub mod error;
pub mod ibkr;
pub mod inbound;
pub mod maintenance;
pub mod session;
pub mod supervisor;
pub mod tastytrade;
pub mod transport;

mod ws;

pub use backoff::BackoffSchedule;
pub use common::{Clock, SystemClock, TokioClock};
pub use error::{Result, SessionError};
pub use ibkr::IbkrTransport;
pub use inbound::{InboundSender, PushOutcome};
pub use maintenance::MaintenanceWindow;
pub use session::{SessionConfig, StreamSession};
pub use supervisor::{StreamSupervisor, SupervisorSettings};
pub use tastytrade::TastytradeTransport;
pub use transport::{FeedTransport, Frame, ParsedPayload};

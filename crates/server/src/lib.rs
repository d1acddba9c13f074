//! Operator-facing surface of greekd
//!
//! - [`status`] - `/health`, `/status` and `/subscriptions` over axum
//! - [`shutdown`] - Process-wide cancellation

pub mod error;
pub mod shutdown;
pub mod status;

pub use error::{Result, ServerError};
pub use shutdown::ShutdownController;
pub use status::{router, AppState, StatusServer};

//! Durable storage for greek snapshots
//!
//! - [`GreekStore`]: the durable time series, with a Postgres implementation
//!   and an in-memory one for tests and dry runs
//! - [`BufferLog`]: the local JSON-lines spill file the writer falls back to
//!   while the store is unavailable

pub mod buffer;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use buffer::BufferLog;
pub use error::{BufferError, BufferResult, StoreError, StoreResult};
pub use memory::MemoryGreekStore;
pub use postgres::PostgresGreekStore;
pub use traits::{GreekStore, SnapshotQuery};

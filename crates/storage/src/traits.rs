//! GreekStore trait definition

use async_trait::async_trait;
use common::{ContractKey, GreekSnapshot, Source};

use crate::error::StoreResult;

/// Read-back filters; results are newest first
#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    pub source: Option<Source>,
    pub account_id: Option<String>,
    pub contract_key: Option<ContractKey>,
    pub limit: usize,
}

impl Default for SnapshotQuery {
    fn default() -> Self {
        Self {
            source: None,
            account_id: None,
            contract_key: None,
            limit: 100,
        }
    }
}

impl SnapshotQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: Source) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn with_contract_key(mut self, key: ContractKey) -> Self {
        self.contract_key = Some(key);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn matches(&self, snapshot: &GreekSnapshot) -> bool {
        self.source.map_or(true, |s| s == snapshot.source)
            && self.account_id.as_deref().map_or(true, |a| a == snapshot.account_id)
            && self.contract_key.as_ref().map_or(true, |k| *k == snapshot.contract_key)
    }
}

/// Durable time series of greek snapshots
///
/// The writer owns exactly one handle; implementations are injected, never
/// reached through globals.
#[async_trait]
pub trait GreekStore: Send + Sync {
    /// Persist a batch in one write
    ///
    /// Inserting a snapshot whose `snapshot_id` already exists is a no-op, so
    /// a replayed batch never duplicates rows. The store stamps
    /// `persisted_at` with its own commit time; any value on the incoming
    /// rows is ignored. Returns the rows actually inserted.
    async fn insert_batch(&self, batch: &[GreekSnapshot]) -> StoreResult<u64>;

    /// Lightweight availability probe
    async fn health_check(&self) -> StoreResult<()>;

    async fn query(&self, query: &SnapshotQuery) -> StoreResult<Vec<GreekSnapshot>>;
}

#[async_trait]
impl<S: GreekStore + ?Sized> GreekStore for std::sync::Arc<S> {
    async fn insert_batch(&self, batch: &[GreekSnapshot]) -> StoreResult<u64> {
        (**self).insert_batch(batch).await
    }

    async fn health_check(&self) -> StoreResult<()> {
        (**self).health_check().await
    }

    async fn query(&self, query: &SnapshotQuery) -> StoreResult<Vec<GreekSnapshot>> {
        (**self).query(query).await
    }
}

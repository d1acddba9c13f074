//! In-memory greek store for tests and dry runs

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{Clock, ContractKey, GreekSnapshot, SystemClock};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::traits::{GreekStore, SnapshotQuery};

#[derive(Default)]
struct State {
    rows: Vec<GreekSnapshot>,
    ids: HashSet<Uuid>,
    unavailable: bool,
    failing_writes: usize,
    write_delay: Duration,
    poisoned: HashSet<ContractKey>,
    insert_calls: usize,
    health_checks: usize,
}

/// Store backed by a vector, with failure injection
///
/// Behaves like the Postgres store where it matters to the writer: one call
/// per batch, idempotent on `snapshot_id`, and an all-or-nothing batch that
/// fails as malformed if any row is bad.
pub struct MemoryGreekStore {
    state: Mutex<State>,
    clock: Mutex<Arc<dyn Clock>>,
}

impl Default for MemoryGreekStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock: Mutex::new(Arc::new(SystemClock)),
        }
    }
}

impl MemoryGreekStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used to stamp `persisted_at` at commit
    pub fn set_clock(&self, clock: Arc<dyn Clock>) {
        *self.clock.lock() = clock;
    }

    /// Make every call fail as transient until set back
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    /// Fail the next `count` writes as transient
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().failing_writes = count;
    }

    /// Delay every write, for timeout and latency tests
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().write_delay = delay;
    }

    /// Reject any batch containing this contract key as malformed
    pub fn poison(&self, key: ContractKey) {
        self.state.lock().poisoned.insert(key);
    }

    /// Rows in commit order
    pub fn rows(&self) -> Vec<GreekSnapshot> {
        self.state.lock().rows.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert_calls(&self) -> usize {
        self.state.lock().insert_calls
    }

    pub fn health_checks(&self) -> usize {
        self.state.lock().health_checks
    }
}

impl State {
    fn validate(&self, row: &GreekSnapshot) -> StoreResult<()> {
        if row.account_id.is_empty() || row.contract_key.is_empty() {
            return Err(StoreError::Malformed(format!("empty identity on {}", row.snapshot_id)));
        }
        if let Some((name, _)) = row
            .numeric_fields()
            .into_iter()
            .find(|(_, value)| value.is_some_and(|v| !v.is_finite()))
        {
            return Err(StoreError::Malformed(format!("non-finite {name} on {}", row.snapshot_id)));
        }
        if self.poisoned.contains(&row.contract_key) {
            return Err(StoreError::Malformed(format!("rejected row for {}", row.contract_key)));
        }
        Ok(())
    }
}

#[async_trait]
impl GreekStore for MemoryGreekStore {
    async fn insert_batch(&self, batch: &[GreekSnapshot]) -> StoreResult<u64> {
        let delay = self.state.lock().write_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.insert_calls += 1;
        if state.unavailable {
            return Err(StoreError::Transient("store offline".into()));
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Transient("connection reset".into()));
        }
        for row in batch {
            state.validate(row)?;
        }

        let committed_at = self.clock.lock().now();
        let mut inserted = 0;
        for row in batch {
            if state.ids.insert(row.snapshot_id) {
                state.rows.push(row.persisted(committed_at));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut state = self.state.lock();
        state.health_checks += 1;
        if state.unavailable {
            Err(StoreError::Transient("store offline".into()))
        } else {
            Ok(())
        }
    }

    async fn query(&self, query: &SnapshotQuery) -> StoreResult<Vec<GreekSnapshot>> {
        let state = self.state.lock();
        let mut matched: Vec<GreekSnapshot> = state.rows.iter().filter(|r| query.matches(r)).cloned().collect();
        matched.sort_by(|a, b| b.event_time.cmp(&a.event_time).then(b.received_at.cmp(&a.received_at)));
        matched.truncate(query.limit);
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;
    use common::Source;

    fn snapshot(key: &str) -> GreekSnapshot {
        GreekSnapshot {
            snapshot_id: Uuid::new_v4(),
            source: Source::Ibkr,
            account_id: "U1".into(),
            underlying_symbol: key.into(),
            contract_key: ContractKey::synthetic(key),
            event_time: Some(Utc::now()),
            received_at: Utc::now(),
            persisted_at: None,
            delta: Some(0.5),
            gamma: None,
            theta: None,
            vega: None,
            rho: None,
            implied_volatility: None,
            underlying_price: None,
            raw_payload: "{}".into(),
            out_of_order: false,
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = MemoryGreekStore::new();
        let batch = vec![snapshot("SPY"), snapshot("QQQ")];

        assert_eq!(store.insert_batch(&batch).await.unwrap(), 2);
        assert_eq!(store.insert_batch(&batch).await.unwrap(), 0);
        assert_eq!(store.len(), 2);
        assert_eq!(store.insert_calls(), 2);
    }

    #[tokio::test]
    async fn test_bad_row_fails_whole_batch() {
        let store = MemoryGreekStore::new();
        let mut bad = snapshot("SPY");
        bad.gamma = Some(f64::NAN);

        let result = store.insert_batch(&[snapshot("QQQ"), bad]).await;
        assert_matches!(result, Err(StoreError::Malformed(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryGreekStore::new();
        store.fail_next_writes(1);
        assert_matches!(store.insert_batch(&[snapshot("SPY")]).await, Err(StoreError::Transient(_)));
        assert!(store.insert_batch(&[snapshot("SPY")]).await.is_ok());

        store.set_available(false);
        assert!(store.health_check().await.is_err());
        store.set_available(true);
        assert!(store.health_check().await.is_ok());
        assert_eq!(store.health_checks(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_at_is_commit_time() {
        let origin = Utc::now();
        let store = MemoryGreekStore::new();
        store.set_clock(Arc::new(common::TokioClock::starting_at(origin)));
        store.set_write_delay(Duration::from_millis(750));

        let mut row = snapshot("SPY");
        row.persisted_at = Some(origin - chrono::Duration::hours(1));
        store.insert_batch(&[row]).await.unwrap();

        let stored = store.rows();
        assert_eq!(stored[0].persisted_at, Some(origin + chrono::Duration::milliseconds(750)));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let store = MemoryGreekStore::new();
        store.insert_batch(&[snapshot("SPY"), snapshot("QQQ")]).await.unwrap();

        let rows = store
            .query(&SnapshotQuery::new().with_contract_key(ContractKey::synthetic("QQQ")))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].underlying_symbol, "QQQ");

        let rows = store.query(&SnapshotQuery::new().with_source(Source::Tastytrade)).await.unwrap();
        assert!(rows.is_empty());
    }
}

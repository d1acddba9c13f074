//! PostgreSQL implementation of the `GreekStore` trait.
//!
//! One table, `greek_snapshots`, keyed by `snapshot_id`. Batches go out as a
//! single multi-row insert that skips ids already present; `persisted_at`
//! is the server's `clock_timestamp()` as each row goes in.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ContractKey, GreekSnapshot, Source};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::traits::{GreekStore, SnapshotQuery};

const INSERT_COLUMNS: &str = "INSERT INTO greek_snapshots (\
    snapshot_id, source, account_id, underlying_symbol, contract_key, \
    event_time, received_at, persisted_at, \
    delta, gamma, theta, vega, rho, implied_volatility, underlying_price, \
    raw_payload, out_of_order) ";

/// Postgres-backed greek store
#[derive(Debug, Clone)]
pub struct PostgresGreekStore {
    pool: PgPool,
}

impl PostgresGreekStore {
    /// Open a connection pool
    pub async fn connect(database_url: &str, max_connections: u32, acquire_timeout: Duration) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(acquire_timeout)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to connect to database: {}", e)))?;

        info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and its indexes if missing
    pub async fn run_migrations(&self) -> StoreResult<()> {
        let migration_sql = include_str!("../../../migrations/001_create_greek_snapshots.sql");
        sqlx::raw_sql(migration_sql).execute(&self.pool).await?;
        info!("Database migrations completed successfully");
        Ok(())
    }
}

#[async_trait]
impl GreekStore for PostgresGreekStore {
    #[instrument(skip_all, fields(rows = batch.len()))]
    async fn insert_batch(&self, batch: &[GreekSnapshot]) -> StoreResult<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_COLUMNS);
        builder.push_values(batch, |mut row, s| {
            row.push_bind(s.snapshot_id)
                .push_bind(s.source.as_str())
                .push_bind(&s.account_id)
                .push_bind(&s.underlying_symbol)
                .push_bind(s.contract_key.as_str())
                .push_bind(s.event_time)
                .push_bind(s.received_at)
                .push("clock_timestamp()")
                .push_bind(s.delta)
                .push_bind(s.gamma)
                .push_bind(s.theta)
                .push_bind(s.vega)
                .push_bind(s.rho)
                .push_bind(s.implied_volatility)
                .push_bind(s.underlying_price)
                .push_bind(&s.raw_payload)
                .push_bind(s.out_of_order);
        });
        builder.push(" ON CONFLICT (snapshot_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        debug!(inserted = result.rows_affected(), "Batch inserted");
        Ok(result.rows_affected())
    }

    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn query(&self, query: &SnapshotQuery) -> StoreResult<Vec<GreekSnapshot>> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM greek_snapshots WHERE TRUE");
        if let Some(source) = query.source {
            builder.push(" AND source = ").push_bind(source.as_str());
        }
        if let Some(account_id) = &query.account_id {
            builder.push(" AND account_id = ").push_bind(account_id.as_str());
        }
        if let Some(key) = &query.contract_key {
            builder.push(" AND contract_key = ").push_bind(key.as_str());
        }
        builder
            .push(" ORDER BY event_time DESC NULLS LAST, received_at DESC LIMIT ")
            .push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows: Vec<SnapshotRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(SnapshotRow::into_domain).collect()
    }
}

/// Database row for a greek snapshot
#[derive(Debug, FromRow)]
struct SnapshotRow {
    snapshot_id: Uuid,
    source: String,
    account_id: String,
    underlying_symbol: String,
    contract_key: String,
    event_time: Option<DateTime<Utc>>,
    received_at: DateTime<Utc>,
    persisted_at: DateTime<Utc>,
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    rho: Option<f64>,
    implied_volatility: Option<f64>,
    underlying_price: Option<f64>,
    raw_payload: String,
    out_of_order: bool,
}

impl SnapshotRow {
    fn into_domain(self) -> StoreResult<GreekSnapshot> {
        let source: Source = self
            .source
            .parse()
            .map_err(|_| StoreError::Malformed(format!("unknown source '{}' in row {}", self.source, self.snapshot_id)))?;

        Ok(GreekSnapshot {
            snapshot_id: self.snapshot_id,
            source,
            account_id: self.account_id,
            underlying_symbol: self.underlying_symbol,
            contract_key: ContractKey::from(self.contract_key),
            event_time: self.event_time,
            received_at: self.received_at,
            persisted_at: Some(self.persisted_at),
            delta: self.delta,
            gamma: self.gamma,
            theta: self.theta,
            vega: self.vega,
            rho: self.rho,
            implied_volatility: self.implied_volatility,
            underlying_price: self.underlying_price,
            raw_payload: self.raw_payload,
            out_of_order: self.out_of_order,
        })
    }
}

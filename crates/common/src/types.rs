//! Domain types shared by the ingestion pipeline
//!
//! This module provides the canonical identity and record types that flow
//! from the normalizer to the durable store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Brokerage feed that produced a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Tastytrade DXLink streamer
    Tastytrade,
    /// Interactive Brokers Client Portal websocket
    Ibkr,
}

impl Source {
    /// All known sources, in a stable order
    pub const ALL: [Source; 2] = [Source::Tastytrade, Source::Ibkr];

    /// Stable lowercase identifier, used in logs, metrics labels and the store
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Tastytrade => "tastytrade",
            Source::Ibkr => "ibkr",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tastytrade" => Ok(Source::Tastytrade),
            "ibkr" => Ok(Source::Ibkr),
            other => Err(Error::invalid_input(format!("unknown source '{other}'"))),
        }
    }
}

/// Option right (call or put)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    /// Single-letter code used in contract keys and OCC-style symbols
    pub fn code(&self) -> char {
        match self {
            OptionRight::Call => 'C',
            OptionRight::Put => 'P',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'C' => Some(OptionRight::Call),
            'P' => Some(OptionRight::Put),
            _ => None,
        }
    }
}

impl std::str::FromStr for OptionRight {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "c" | "call" => Ok(OptionRight::Call),
            "p" | "put" => Ok(OptionRight::Put),
            other => Err(Error::invalid_input(format!("unknown option right '{other}'"))),
        }
    }
}

/// Description of a tradable instrument, as far as a source tells us
///
/// Expiration, strike and right are all present for an option; a spec with
/// any of them missing is treated as a non-derivative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub underlying: String,
    #[serde(default)]
    pub expiration: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub right: Option<OptionRight>,
}

impl InstrumentSpec {
    /// Create an option spec
    pub fn option(
        underlying: impl Into<String>,
        expiration: NaiveDate,
        strike: f64,
        right: OptionRight,
    ) -> Self {
        Self {
            underlying: underlying.into().to_uppercase(),
            expiration: Some(expiration),
            strike: Some(strike),
            right: Some(right),
        }
    }

    /// Create a spec for a non-derivative instrument
    pub fn underlying_only(underlying: impl Into<String>) -> Self {
        Self {
            underlying: underlying.into().to_uppercase(),
            expiration: None,
            strike: None,
            right: None,
        }
    }

    pub fn is_option(&self) -> bool {
        self.expiration.is_some() && self.strike.is_some() && self.right.is_some()
    }

    /// Canonical contract key for this instrument
    pub fn contract_key(&self) -> ContractKey {
        match (self.expiration, self.strike, self.right) {
            (Some(expiration), Some(strike), Some(right)) => {
                ContractKey::option(&self.underlying, expiration, strike, right)
            }
            _ => ContractKey::synthetic(&self.underlying),
        }
    }
}

/// Canonical identity of an instrument, stable across sources and reconnects
///
/// Options render as `UNDERLYING:YYYY-MM-DD:STRIKE:RIGHT`, e.g.
/// `SPY:2024-01-19:452.5:C`. Non-derivatives use the bare underlying symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContractKey(String);

impl ContractKey {
    pub fn option(underlying: &str, expiration: NaiveDate, strike: f64, right: OptionRight) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            underlying.trim().to_uppercase(),
            expiration.format("%Y-%m-%d"),
            format_strike(strike),
            right.code()
        ))
    }

    pub fn synthetic(underlying: &str) -> Self {
        Self(underlying.trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Wraps an already-rendered key, e.g. one read back from the store
impl From<String> for ContractKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl std::fmt::Display for ContractKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Render a strike with no trailing zeros so `450`, `450.0` and `450.00`
/// from different feeds produce the same key.
fn format_strike(strike: f64) -> String {
    let rendered = format!("{:.4}", strike);
    let trimmed = rendered.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

/// One persisted observation of a contract's risk sensitivities
///
/// Created by the normalizer and never mutated afterwards; the writer only
/// produces stamped copies via [`GreekSnapshot::persisted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreekSnapshot {
    /// Row identity used for idempotent inserts
    pub snapshot_id: Uuid,
    pub source: Source,
    pub account_id: String,
    pub underlying_symbol: String,
    pub contract_key: ContractKey,
    /// Authoritative timestamp from the source, when it sends one
    pub event_time: Option<DateTime<Utc>>,
    /// Local ingestion clock, stamped when the normalizer dequeues the payload
    pub received_at: DateTime<Utc>,
    /// Write-commit clock; `None` until the writer persists the record
    #[serde(default)]
    pub persisted_at: Option<DateTime<Utc>>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub rho: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub underlying_price: Option<f64>,
    /// Untouched source payload, kept for audit
    pub raw_payload: String,
    /// Set when `event_time` is older than the latest accepted one for this key
    #[serde(default)]
    pub out_of_order: bool,
}

impl GreekSnapshot {
    /// True when at least one of delta, gamma, theta, vega, rho is present
    pub fn has_any_greek(&self) -> bool {
        [self.delta, self.gamma, self.theta, self.vega, self.rho]
            .iter()
            .any(Option::is_some)
    }

    /// Copy of this record stamped with its commit time
    pub fn persisted(&self, at: DateTime<Utc>) -> Self {
        Self {
            persisted_at: Some(at),
            ..self.clone()
        }
    }

    /// Receipt-to-commit latency for a write acknowledged at `committed_at`
    ///
    /// `None` if the clock puts the commit before receipt.
    pub fn persist_latency(&self, committed_at: DateTime<Utc>) -> Option<std::time::Duration> {
        (committed_at - self.received_at).to_std().ok()
    }

    /// All numeric fields, for schema checks
    pub fn numeric_fields(&self) -> [(&'static str, Option<f64>); 7] {
        [
            ("delta", self.delta),
            ("gamma", self.gamma),
            ("theta", self.theta),
            ("vega", self.vega),
            ("rho", self.rho),
            ("implied_volatility", self.implied_volatility),
            ("underlying_price", self.underlying_price),
        ]
    }
}

/// A snapshot spilled to the local buffer while the store was unavailable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedRecord {
    /// Monotonically increasing local sequence number; replay order
    pub seq: u64,
    pub snapshot: GreekSnapshot,
}

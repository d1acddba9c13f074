//! Configuration for the greekstream ingestion service
//!
//! The whole process is driven by one YAML document. Values may reference
//! environment variables as `${VAR}`; these are substituted before parsing.

use chrono::NaiveDate;
use common::{InstrumentSpec, OptionRight, Source, Subscription, SubscriptionSet};
use serde::{Deserialize, Serialize};

pub mod defaults;
pub mod parser;
pub mod substitution;
pub mod validator;

pub use defaults::*;
pub use parser::*;
pub use substitution::*;
pub use validator::*;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub status: StatusConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Initial subscription set; the position collaborator may replace it at runtime
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,
    /// One of: pretty, json, compact
    #[serde(rename = "log_format")]
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourcesConfig {
    #[serde(default)]
    pub tastytrade: Option<SourceConfig>,
    #[serde(default)]
    pub ibkr: Option<SourceConfig>,
}

impl SourcesConfig {
    pub fn get(&self, source: Source) -> Option<&SourceConfig> {
        match source {
            Source::Tastytrade => self.tastytrade.as_ref(),
            Source::Ibkr => self.ibkr.as_ref(),
        }
    }

    /// Sources with a config block that is switched on
    pub fn enabled(&self) -> Vec<(Source, &SourceConfig)> {
        Source::ALL
            .into_iter()
            .filter_map(|source| self.get(source).map(|cfg| (source, cfg)))
            .filter(|(_, cfg)| cfg.enabled)
            .collect()
    }
}

/// Connection parameters for one brokerage feed
///
/// The token is produced by the login flow that runs before this process.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub url: String,
    pub token: String,
    #[serde(rename = "account_id")]
    pub account_id: String,
    #[serde(rename = "connect_timeout_seconds")]
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    #[serde(rename = "heartbeat_interval_seconds")]
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// Silence longer than `interval * multiple` counts as a dead transport
    #[serde(rename = "heartbeat_timeout_multiple")]
    #[serde(default = "default_heartbeat_timeout_multiple")]
    pub heartbeat_timeout_multiple: u32,
    #[serde(default)]
    pub maintenance: Option<MaintenanceConfig>,
}

impl SourceConfig {
    /// Configured maintenance window, or the default daily reset window for IBKR
    pub fn maintenance_window(&self, source: Source) -> Option<MaintenanceConfig> {
        match (&self.maintenance, source) {
            (Some(window), _) => Some(window.clone()),
            (None, Source::Ibkr) => Some(default_ibkr_maintenance()),
            (None, Source::Tastytrade) => None,
        }
    }
}

/// Daily window during which the source is known to be resetting
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MaintenanceConfig {
    /// IANA timezone name, e.g. `America/New_York`
    pub timezone: String,
    /// `HH:MM`
    pub start: String,
    /// `HH:MM`; may be earlier than `start` when the window wraps midnight
    pub end: String,
    #[serde(rename = "resume_at")]
    pub resume_at: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Reconnect delays; the last value repeats
    #[serde(rename = "backoff_seconds")]
    #[serde(default = "default_backoff_seconds")]
    pub backoff_seconds: Vec<u64>,
    #[serde(rename = "inbound_capacity")]
    #[serde(default = "default_inbound_capacity")]
    pub inbound_capacity: usize,
    #[serde(rename = "push_timeout_ms")]
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,
    /// Per-session queue for messages that missed the push timeout
    #[serde(rename = "overflow_capacity")]
    #[serde(default = "default_overflow_capacity")]
    pub overflow_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_seconds: default_backoff_seconds(),
            inbound_capacity: default_inbound_capacity(),
            push_timeout_ms: default_push_timeout_ms(),
            overflow_capacity: default_overflow_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NormalizerConfig {
    /// Forwarded event times remembered per contract key for dedup
    #[serde(rename = "dedup_history")]
    #[serde(default = "default_dedup_history")]
    pub dedup_history: usize,
    #[serde(rename = "output_capacity")]
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            dedup_history: default_dedup_history(),
            output_capacity: default_output_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriterConfig {
    #[serde(rename = "batch_size")]
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(rename = "flush_interval_ms")]
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Consecutive failed writes that open the circuit
    #[serde(rename = "failure_threshold")]
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(rename = "probe_interval_seconds")]
    #[serde(default = "default_probe_interval_seconds")]
    pub probe_interval_seconds: u64,
    #[serde(rename = "write_timeout_ms")]
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(rename = "buffer_path")]
    #[serde(default = "default_buffer_path")]
    pub buffer_path: String,
    #[serde(rename = "latency_target_ms")]
    #[serde(default = "default_latency_target_ms")]
    pub latency_target_ms: u64,
    #[serde(rename = "latency_window")]
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            failure_threshold: default_failure_threshold(),
            probe_interval_seconds: default_probe_interval_seconds(),
            write_timeout_ms: default_write_timeout_ms(),
            buffer_path: default_buffer_path(),
            latency_target_ms: default_latency_target_ms(),
            latency_window: default_latency_window(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// `postgres` or `memory`
    #[serde(rename = "type")]
    pub storage_type: String,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub url: String,
    #[serde(rename = "max_connections")]
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(rename = "connection_timeout_seconds")]
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_seconds: u64,
    #[serde(rename = "run_migrations")]
    #[serde(default = "default_enabled")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StatusConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_status_port")]
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_status_port(),
        }
    }
}

impl StatusConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_metrics_port(),
        }
    }
}

impl MetricsConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One configured subscription
///
/// Tastytrade entries may omit the instrument fields; they are then parsed
/// from the streamer symbol. IBKR entries name a conid and must carry them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionEntry {
    pub source: Source,
    pub symbol: String,
    #[serde(default)]
    pub underlying: Option<String>,
    #[serde(default)]
    pub expiration: Option<NaiveDate>,
    #[serde(default)]
    pub strike: Option<f64>,
    #[serde(default)]
    pub right: Option<OptionRight>,
}

impl SubscriptionEntry {
    pub fn instrument(&self) -> InstrumentSpec {
        match (&self.underlying, self.expiration, self.strike, self.right) {
            (Some(underlying), Some(expiration), Some(strike), Some(right)) => {
                InstrumentSpec::option(underlying.as_str(), expiration, strike, right)
            }
            (Some(underlying), _, _, _) => InstrumentSpec::underlying_only(underlying.as_str()),
            (None, _, _, _) => common::payload::parse_streamer_symbol(&self.symbol),
        }
    }

    pub fn to_subscription(&self) -> Subscription {
        Subscription::new(self.source, self.symbol.trim(), self.instrument())
    }
}

impl MasterConfig {
    pub fn subscription_set(&self) -> SubscriptionSet {
        SubscriptionSet::new(
            self.subscriptions
                .iter()
                .map(SubscriptionEntry::to_subscription)
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
service:
  name: greekd-test
  log_format: json
sources:
  tastytrade:
    url: wss://tasty-openapi-ws.dxfeed.com/realtime
    token: abc
    account_id: 5WX01234
  ibkr:
    url: wss://localhost:5000/v1/api/ws
    token: def
    account_id: U1234567
    heartbeat_interval_seconds: 30
    maintenance:
      timezone: America/New_York
      start: "23:40"
      end: "01:00"
      resume_at: "01:05"
supervisor:
  backoff_seconds: [5, 10, 20]
writer:
  batch_size: 25
storage:
  type: memory
subscriptions:
  - source: tastytrade
    symbol: .SPY240119C450
  - source: ibkr
    symbol: "265598"
    underlying: SPY
    expiration: 2024-01-19
    strike: 450
    right: call
"#;

    #[test]
    fn test_parse_sample_config() {
        let config: MasterConfig = serde_yaml::from_str(SAMPLE).unwrap();

        assert_eq!(config.service.name, "greekd-test");
        assert_eq!(config.supervisor.backoff_seconds, vec![5, 10, 20]);
        assert_eq!(config.writer.batch_size, 25);
        assert_eq!(config.writer.flush_interval_ms, 1000);
        assert_eq!(config.storage.storage_type, "memory");

        let ibkr = config.sources.ibkr.as_ref().unwrap();
        assert!(ibkr.enabled);
        assert_eq!(ibkr.heartbeat_interval_seconds, 30);
        assert_eq!(ibkr.maintenance.as_ref().unwrap().resume_at, "01:05");
        assert_eq!(config.sources.enabled().len(), 2);
    }

    #[test]
    fn test_subscriptions_resolve_to_same_key() {
        let config: MasterConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let set = config.subscription_set();
        let keys: Vec<String> = set.iter().map(|s| s.contract_key().to_string()).collect();
        assert_eq!(keys, vec!["SPY:2024-01-19:450:C", "SPY:2024-01-19:450:C"]);
    }

    #[test]
    fn test_generate_default_config() {
        let config = generate_default_config();
        let report = validate_config(&config);
        // Only the credential placeholders are left for the operator to fill in
        assert!(report
            .errors
            .iter()
            .all(|e| matches!(e, ValidationError::InvalidEnvVar { .. })));

        let yaml = serde_yaml::to_string(&config).unwrap();
        let reparsed: MasterConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(reparsed.writer.batch_size, config.writer.batch_size);
    }
}

use crate::*;
use chrono::NaiveTime;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ValidationError {
    #[error("At least one source must be enabled")]
    NoEnabledSources,

    #[error("Source {source_name}: {message}")]
    InvalidSource { source_name: String, message: String },

    #[error("Source {source_name} maintenance window: {message}")]
    InvalidMaintenance { source_name: String, message: String },

    #[error("Invalid backoff schedule: {0}")]
    InvalidBackoff(String),

    #[error("{field} must be a positive integer")]
    InvalidPositiveInteger { field: String },

    #[error("Invalid log format: {0}. Must be one of: pretty, json, compact")]
    InvalidLogFormat(String),

    #[error("Writer: {message}")]
    InvalidWriter { message: String },

    #[error("Storage: {message}")]
    InvalidStorage { message: String },

    #[error("Subscription '{symbol}': {message}")]
    InvalidSubscription { symbol: String, message: String },

    #[error("Invalid time format '{time}': {message}")]
    InvalidTimeFormat { time: String, message: String },

    #[error("Environment variable '{var}' is missing or invalid: {message}")]
    InvalidEnvVar { var: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct DefaultApplied {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
    pub defaults_applied: Vec<DefaultApplied>,
}

impl ValidationReport {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
            defaults_applied: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, field: &str, message: &str) {
        self.warnings.push(ValidationWarning {
            field: field.to_string(),
            message: message.to_string(),
        });
    }

    pub fn add_default(&mut self, field: &str, value: &str) {
        self.defaults_applied.push(DefaultApplied {
            field: field.to_string(),
            value: value.to_string(),
        });
    }
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self::new()
    }
}

pub fn validate_config(config: &MasterConfig) -> ValidationReport {
    let mut report = ValidationReport::new();

    validate_service(&config.service, &mut report);
    validate_sources(&config.sources, &mut report);
    validate_supervisor(&config.supervisor, &mut report);
    validate_normalizer(&config.normalizer, &mut report);
    validate_writer(&config.writer, &mut report);
    validate_storage(&config.storage, &mut report);
    validate_subscriptions(config, &mut report);

    report
}

fn validate_service(service: &ServiceConfig, report: &mut ValidationReport) {
    let valid_formats = ["pretty", "json", "compact"];
    if !valid_formats.contains(&service.log_format.as_str()) {
        report.add_error(ValidationError::InvalidLogFormat(service.log_format.clone()));
    }
}

fn validate_sources(sources: &SourcesConfig, report: &mut ValidationReport) {
    if sources.enabled().is_empty() {
        report.add_error(ValidationError::NoEnabledSources);
    }

    for (source, cfg) in sources.enabled() {
        validate_source(source, cfg, report);
    }
}

fn validate_source(source: Source, cfg: &SourceConfig, report: &mut ValidationReport) {
    let name = source.as_str();
    let source_error = |message: &str| ValidationError::InvalidSource {
        source_name: name.to_string(),
        message: message.to_string(),
    };

    match url::Url::parse(&cfg.url) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => {
            if url.scheme() == "ws" {
                report.add_warning(
                    &format!("sources.{}.url", name),
                    "Unencrypted websocket; use wss outside of local testing",
                );
            }
        }
        Ok(url) => report.add_error(source_error(&format!(
            "url scheme must be ws or wss, got '{}'",
            url.scheme()
        ))),
        Err(e) if has_unresolved_env_vars(&cfg.url) => report.add_error(ValidationError::InvalidEnvVar {
            var: format!("sources.{}.url", name),
            message: e.to_string(),
        }),
        Err(e) => report.add_error(source_error(&format!("invalid url '{}': {}", cfg.url, e))),
    }

    for (field, value) in [("token", &cfg.token), ("account_id", &cfg.account_id)] {
        if value.trim().is_empty() {
            report.add_error(source_error(&format!("{} is required", field)));
        } else if has_unresolved_env_vars(value) {
            report.add_error(ValidationError::InvalidEnvVar {
                var: value.trim_start_matches("${").trim_end_matches('}').to_string(),
                message: format!("sources.{}.{} is not set", name, field),
            });
        }
    }

    if cfg.connect_timeout_seconds == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: format!("sources.{}.connect_timeout_seconds", name),
        });
    }

    if cfg.heartbeat_interval_seconds == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: format!("sources.{}.heartbeat_interval_seconds", name),
        });
    }

    match cfg.heartbeat_timeout_multiple {
        0 => report.add_error(ValidationError::InvalidPositiveInteger {
            field: format!("sources.{}.heartbeat_timeout_multiple", name),
        }),
        1 => report.add_warning(
            &format!("sources.{}.heartbeat_timeout_multiple", name),
            "A multiple of 1 reconnects without ever reporting DEGRADED",
        ),
        _ => {}
    }

    match (&cfg.maintenance, source) {
        (Some(window), _) => validate_maintenance(name, window, report),
        (None, Source::Ibkr) => {
            let window = default_ibkr_maintenance();
            report.add_default(
                &format!("sources.{}.maintenance", name),
                &format!(
                    "{} {}-{} resume {}",
                    window.timezone, window.start, window.end, window.resume_at
                ),
            );
        }
        (None, Source::Tastytrade) => {}
    }
}

fn parse_hhmm(time: &str, report: &mut ValidationReport) -> Option<NaiveTime> {
    match NaiveTime::parse_from_str(time, "%H:%M") {
        Ok(t) => Some(t),
        Err(e) => {
            report.add_error(ValidationError::InvalidTimeFormat {
                time: time.to_string(),
                message: format!("expected HH:MM ({})", e),
            });
            None
        }
    }
}

/// Latest `resume_at` accepted after a maintenance window ends
const MAX_RESUME_GAP_MINUTES: i64 = 60;

fn validate_maintenance(source: &str, window: &MaintenanceConfig, report: &mut ValidationReport) {
    if window.timezone.parse::<chrono_tz::Tz>().is_err() {
        report.add_error(ValidationError::InvalidMaintenance {
            source_name: source.to_string(),
            message: format!("unknown timezone '{}'", window.timezone),
        });
    }

    let start = parse_hhmm(&window.start, report);
    let end = parse_hhmm(&window.end, report);
    let resume = parse_hhmm(&window.resume_at, report);

    if let (Some(start), Some(end), Some(resume)) = (start, end, resume) {
        if start == end {
            report.add_error(ValidationError::InvalidMaintenance {
                source_name: source.to_string(),
                message: "start and end must differ".to_string(),
            });
            return;
        }

        let inside = if start < end {
            resume >= start && resume < end
        } else {
            resume >= start || resume < end
        };
        if inside {
            report.add_error(ValidationError::InvalidMaintenance {
                source_name: source.to_string(),
                message: format!("resume_at {} falls inside the window", window.resume_at),
            });
            return;
        }

        // Anything later than this reads as a resume time before the window
        let gap = (resume - end).num_minutes().rem_euclid(24 * 60);
        if gap > MAX_RESUME_GAP_MINUTES {
            report.add_error(ValidationError::InvalidMaintenance {
                source_name: source.to_string(),
                message: format!(
                    "resume_at {} is {} minutes after end {}; at most {} allowed",
                    window.resume_at, gap, window.end, MAX_RESUME_GAP_MINUTES
                ),
            });
        }
    }
}

fn validate_supervisor(supervisor: &SupervisorConfig, report: &mut ValidationReport) {
    if supervisor.backoff_seconds.is_empty() {
        report.add_error(ValidationError::InvalidBackoff(
            "at least one delay is required".to_string(),
        ));
    } else if supervisor.backoff_seconds.contains(&0) {
        report.add_error(ValidationError::InvalidBackoff(format!(
            "delays must be positive, got {:?}",
            supervisor.backoff_seconds
        )));
    } else if supervisor.backoff_seconds.windows(2).any(|w| w[1] < w[0]) {
        report.add_warning(
            "supervisor.backoff_seconds",
            "Delays are not non-decreasing; the last value repeats indefinitely",
        );
    }

    for (field, value) in [
        ("supervisor.inbound_capacity", supervisor.inbound_capacity as u64),
        ("supervisor.push_timeout_ms", supervisor.push_timeout_ms),
        ("supervisor.overflow_capacity", supervisor.overflow_capacity as u64),
    ] {
        if value == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: field.to_string(),
            });
        }
    }
}

fn validate_normalizer(normalizer: &NormalizerConfig, report: &mut ValidationReport) {
    if normalizer.dedup_history == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "normalizer.dedup_history".to_string(),
        });
    }
    if normalizer.output_capacity == 0 {
        report.add_error(ValidationError::InvalidPositiveInteger {
            field: "normalizer.output_capacity".to_string(),
        });
    }
}

fn validate_writer(writer: &WriterConfig, report: &mut ValidationReport) {
    for (field, value) in [
        ("writer.batch_size", writer.batch_size as u64),
        ("writer.flush_interval_ms", writer.flush_interval_ms),
        ("writer.failure_threshold", writer.failure_threshold as u64),
        ("writer.probe_interval_seconds", writer.probe_interval_seconds),
        ("writer.write_timeout_ms", writer.write_timeout_ms),
        ("writer.latency_target_ms", writer.latency_target_ms),
        ("writer.latency_window", writer.latency_window as u64),
    ] {
        if value == 0 {
            report.add_error(ValidationError::InvalidPositiveInteger {
                field: field.to_string(),
            });
        }
    }

    if writer.buffer_path.trim().is_empty() {
        report.add_error(ValidationError::InvalidWriter {
            message: "buffer_path is required".to_string(),
        });
    }

    if writer.batch_size > 1000 {
        report.add_warning(
            "writer.batch_size",
            "Large batches delay the first record of each batch and may breach the latency target",
        );
    }

    if writer.flush_interval_ms >= writer.latency_target_ms && writer.latency_target_ms > 0 {
        report.add_warning(
            "writer.flush_interval_ms",
            "Flush interval is not below the latency target; slow trickles will miss the target",
        );
    }
}

fn validate_storage(storage: &StorageConfig, report: &mut ValidationReport) {
    match storage.storage_type.as_str() {
        "postgres" => match &storage.postgres {
            Some(pg) => validate_postgres_config(pg, report),
            None => report.add_error(ValidationError::InvalidStorage {
                message: "Storage type is 'postgres' but postgres configuration is missing"
                    .to_string(),
            }),
        },
        "memory" => report.add_warning(
            "storage.type",
            "In-memory storage keeps nothing across restarts",
        ),
        other => report.add_error(ValidationError::InvalidStorage {
            message: format!("Invalid storage type '{}'. Must be one of: postgres, memory", other),
        }),
    }
}

fn validate_postgres_config(pg: &PostgresConfig, report: &mut ValidationReport) {
    if pg.url.is_empty() || has_unresolved_env_vars(&pg.url) {
        report.add_error(ValidationError::InvalidEnvVar {
            var: "DATABASE_URL".to_string(),
            message: "postgres url is missing or invalid".to_string(),
        });
    }

    if pg.max_connections == 0 {
        report.add_error(ValidationError::InvalidStorage {
            message: "max_connections must be a positive integer".to_string(),
        });
    }

    if pg.connection_timeout_seconds == 0 {
        report.add_error(ValidationError::InvalidStorage {
            message: "connection_timeout_seconds must be a positive integer".to_string(),
        });
    }
}

fn validate_subscriptions(config: &MasterConfig, report: &mut ValidationReport) {
    if config.subscriptions.is_empty() {
        report.add_warning(
            "subscriptions",
            "No initial subscriptions; sessions stay idle until a set is pushed",
        );
    }

    for entry in &config.subscriptions {
        let enabled = config
            .sources
            .get(entry.source)
            .map(|s| s.enabled)
            .unwrap_or(false);
        if !enabled {
            report.add_warning(
                &format!("subscriptions.{}", entry.symbol),
                &format!("source {} is not enabled; entry ignored", entry.source),
            );
        }

        if entry.symbol.trim().is_empty() {
            report.add_error(ValidationError::InvalidSubscription {
                symbol: entry.symbol.clone(),
                message: "symbol is required".to_string(),
            });
            continue;
        }

        if entry.source == Source::Ibkr {
            if entry.symbol.trim().parse::<i64>().is_err() {
                report.add_error(ValidationError::InvalidSubscription {
                    symbol: entry.symbol.clone(),
                    message: "IBKR subscriptions name a numeric conid".to_string(),
                });
            }
            if entry.underlying.is_none() {
                report.add_error(ValidationError::InvalidSubscription {
                    symbol: entry.symbol.clone(),
                    message: "IBKR subscriptions must name the underlying".to_string(),
                });
            }
        }

        if let Some(strike) = entry.strike {
            if !strike.is_finite() || strike <= 0.0 {
                report.add_error(ValidationError::InvalidSubscription {
                    symbol: entry.symbol.clone(),
                    message: format!("strike must be positive, got {}", strike),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> MasterConfig {
        let mut config = generate_default_config();
        for source in [&mut config.sources.tastytrade, &mut config.sources.ibkr] {
            if let Some(cfg) = source.as_mut() {
                cfg.token = "token".to_string();
                cfg.account_id = "acct".to_string();
            }
        }
        if let Some(pg) = config.storage.postgres.as_mut() {
            pg.url = "postgres://localhost/greeks".to_string();
        }
        config
    }

    #[test]
    fn test_valid_config_passes() {
        let report = validate_config(&valid_config());
        assert!(report.is_valid(), "{:?}", report.errors);
    }

    #[test]
    fn test_empty_backoff_is_fatal() {
        let mut config = valid_config();
        config.supervisor.backoff_seconds.clear();
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidBackoff(_))));

        config.supervisor.backoff_seconds = vec![5, 0];
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn test_unresolved_token_is_fatal() {
        let mut config = valid_config();
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.token = "${IBKR_SESSION_TOKEN}".to_string();
        }
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidEnvVar { var, .. } if var == "IBKR_SESSION_TOKEN")));
    }

    #[test]
    fn test_no_enabled_sources() {
        let mut config = valid_config();
        config.sources.tastytrade = None;
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.enabled = false;
        }
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::NoEnabledSources)));
    }

    #[test]
    fn test_bad_maintenance_window() {
        let mut config = valid_config();
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.maintenance = Some(MaintenanceConfig {
                timezone: "Mars/Olympus".to_string(),
                start: "23:40".to_string(),
                end: "1am".to_string(),
                resume_at: "00:30".to_string(),
            });
        }
        let report = validate_config(&config);
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidMaintenance { .. })));
        assert!(report
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::InvalidTimeFormat { .. })));
    }

    #[test]
    fn test_resume_inside_wrapping_window_rejected() {
        let mut config = valid_config();
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.maintenance = Some(MaintenanceConfig {
                timezone: "America/New_York".to_string(),
                start: "23:40".to_string(),
                end: "01:00".to_string(),
                resume_at: "00:30".to_string(),
            });
        }
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn test_resume_before_window_start_rejected() {
        let window = |resume_at: &str| MaintenanceConfig {
            timezone: "America/New_York".to_string(),
            start: "23:40".to_string(),
            end: "01:00".to_string(),
            resume_at: resume_at.to_string(),
        };

        let mut config = valid_config();
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.maintenance = Some(window("23:00"));
        }
        let report = validate_config(&config);
        assert!(report.errors.iter().any(|e| matches!(
            e,
            ValidationError::InvalidMaintenance { message, .. } if message.contains("1320 minutes")
        )));

        for resume_at in ["01:00", "01:05", "02:00"] {
            if let Some(cfg) = config.sources.ibkr.as_mut() {
                cfg.maintenance = Some(window(resume_at));
            }
            assert!(validate_config(&config).is_valid(), "resume_at {resume_at}");
        }
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.maintenance = Some(window("02:01"));
        }
        assert!(!validate_config(&config).is_valid());
    }

    #[test]
    fn test_missing_ibkr_window_reports_default() {
        let mut config = valid_config();
        if let Some(cfg) = config.sources.ibkr.as_mut() {
            cfg.maintenance = None;
        }
        let report = validate_config(&config);
        assert!(report.is_valid());
        assert!(report
            .defaults_applied
            .iter()
            .any(|d| d.field == "sources.ibkr.maintenance"));
    }

    #[test]
    fn test_ibkr_subscription_needs_conid_and_underlying() {
        let mut config = valid_config();
        config.subscriptions.push(SubscriptionEntry {
            source: Source::Ibkr,
            symbol: "SPY".to_string(),
            underlying: None,
            expiration: None,
            strike: None,
            right: None,
        });
        let report = validate_config(&config);
        let count = report
            .errors
            .iter()
            .filter(|e| matches!(e, ValidationError::InvalidSubscription { .. }))
            .count();
        assert_eq!(count, 2);
    }
}

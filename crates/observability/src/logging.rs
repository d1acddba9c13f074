//! Logging setup for greekd
//!
//! One global `tracing` subscriber per process. The pipeline logs with
//! structured fields (`source`, `contract_key`, `circuit`, ...) so the json
//! format is the one to ship to a log aggregator.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Directives used when `RUST_LOG` is unset
///
/// sqlx logs every statement at `info` and tungstenite every frame at
/// `debug`; at the writer's batch rate both drown out pipeline events.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,tungstenite=warn,tokio_tungstenite=warn";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable, coloured, with file and line
    #[default]
    Pretty,
    /// JSON lines with event fields flattened to the top level
    Json,
    /// One line per event
    Compact,
}

impl LogFormat {
    /// Parse from string (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "json" => Some(Self::Json),
            "compact" => Some(Self::Compact),
            _ => None,
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown log format: {}", s))
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides [`DEFAULT_FILTER`]; `RUST_LOG=normalizer=debug,info`
/// shows why individual payloads were rejected. Fails if a subscriber is
/// already installed.
pub fn init_logging(service_name: &str, format: LogFormat) -> anyhow::Result<()> {
    let registry = tracing_subscriber::registry().with(env_filter());

    match format {
        LogFormat::Pretty => registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_ansi(true),
            )
            .try_init()?,
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false),
            )
            .try_init()?,
        LogFormat::Compact => registry.with(fmt::layer().compact().with_target(false)).try_init()?,
    }

    tracing::info!(service = service_name, format = ?format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parsing() {
        assert_eq!(LogFormat::parse("pretty"), Some(LogFormat::Pretty));
        assert_eq!(LogFormat::parse(" JSON "), Some(LogFormat::Json));
        assert_eq!(LogFormat::parse("compact"), Some(LogFormat::Compact));
        assert_eq!(LogFormat::parse("logfmt"), None);
        assert!("logfmt".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }

    #[test]
    fn test_second_init_fails() {
        // Either this call or another test's installed the global subscriber
        let _ = init_logging("test", LogFormat::Compact);
        assert!(init_logging("test", LogFormat::Compact).is_err());
    }
}

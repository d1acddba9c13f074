use crate::*;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, instrument};

#[instrument(skip(path))]
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<MasterConfig> {
    let path = path.as_ref();
    info!("Loading configuration from: {:?}", path);

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    debug!("Config file content length: {} bytes", content.len());
    parse_config(&content)
}

/// Parse a YAML document after environment substitution
pub fn parse_config(content: &str) -> Result<MasterConfig> {
    let substituted = substitution::substitute_env_vars(content)?;
    debug!("Environment variable substitution completed");

    let config: MasterConfig = serde_yaml::from_str(&substituted)
        .with_context(|| "Failed to parse YAML configuration")?;

    info!("Configuration loaded successfully");
    Ok(config)
}

#[instrument]
pub fn generate_default_config() -> MasterConfig {
    use defaults::*;

    MasterConfig {
        service: ServiceConfig::default(),
        sources: SourcesConfig {
            tastytrade: Some(SourceConfig {
                enabled: true,
                url: "wss://tasty-openapi-ws.dxfeed.com/realtime".to_string(),
                token: "${TASTYTRADE_STREAMER_TOKEN}".to_string(),
                account_id: "${TASTYTRADE_ACCOUNT_ID}".to_string(),
                connect_timeout_seconds: default_connect_timeout_seconds(),
                heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
                heartbeat_timeout_multiple: default_heartbeat_timeout_multiple(),
                maintenance: None,
            }),
            ibkr: Some(SourceConfig {
                enabled: true,
                url: "wss://localhost:5000/v1/api/ws".to_string(),
                token: "${IBKR_SESSION_TOKEN}".to_string(),
                account_id: "${IBKR_ACCOUNT_ID}".to_string(),
                connect_timeout_seconds: default_connect_timeout_seconds(),
                heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
                heartbeat_timeout_multiple: default_heartbeat_timeout_multiple(),
                maintenance: Some(default_ibkr_maintenance()),
            }),
        },
        supervisor: SupervisorConfig::default(),
        normalizer: NormalizerConfig::default(),
        writer: WriterConfig::default(),
        storage: StorageConfig {
            storage_type: "postgres".to_string(),
            postgres: Some(PostgresConfig {
                url: "${DATABASE_URL}".to_string(),
                max_connections: default_max_connections(),
                connection_timeout_seconds: default_connection_timeout(),
                run_migrations: true,
            }),
        },
        status: StatusConfig::default(),
        metrics: MetricsConfig::default(),
        subscriptions: vec![],
    }
}

#[instrument(skip(config))]
pub fn save_config<P: AsRef<Path> + std::fmt::Debug>(config: &MasterConfig, path: P) -> Result<()> {
    let path = path.as_ref();
    info!("Saving configuration to: {:?}", path);

    let yaml = serde_yaml::to_string(config)
        .with_context(|| "Failed to serialize configuration to YAML")?;

    fs::write(path, yaml)
        .with_context(|| format!("Failed to write config file: {:?}", path))?;

    info!("Configuration saved successfully");
    Ok(())
}

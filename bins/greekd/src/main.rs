//! greekd binary
//!
//! Entry point for the ingestion service. `start` wires the pipeline
//! (stream sessions, normalizer, batch writer, status server) and runs it
//! until Ctrl+C; `validate` and `init` work on configuration files only.

use anyhow::{Context, Result};
use cli::{Cli, Commands, SourceArg};
use common::Source;
use config::{
    generate_default_config, load_config, save_config, validate_config, MasterConfig, SourceConfig,
};
use normalizer::NormalizationProcessor;
use observability::{init_logging, init_metrics, LogFormat};
use server::{ShutdownController, StatusServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use storage::{BufferLog, GreekStore, MemoryGreekStore, PostgresGreekStore};
use stream::{
    BackoffSchedule, IbkrTransport, MaintenanceWindow, SessionConfig, StreamSupervisor,
    SupervisorSettings, TastytradeTransport,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use writer::{BatchWriter, WriterSettings};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Start {
            config,
            only,
            status_port,
            dry_run,
        } => start_pipeline(config, only, status_port, dry_run).await,
        Commands::Validate { config } => {
            init_logging("greekd", LogFormat::Pretty)?;
            info!("Executing 'validate' command");
            validate_command(config).await
        }
        Commands::Init { output } => {
            init_logging("greekd", LogFormat::Pretty)?;
            info!("Executing 'init' command");
            init_command(output).await
        }
    }
}

async fn start_pipeline(
    config_path: PathBuf,
    only: Vec<SourceArg>,
    status_port: Option<u16>,
    dry_run: bool,
) -> Result<()> {
    let config = load_config(&config_path)?;

    // The log format lives in the config, so logging starts once it is read
    let format = LogFormat::parse(&config.service.log_format).unwrap_or_default();
    init_logging(&config.service.name, format)?;
    info!(path = ?config_path, "Executing 'start' command");

    let report = validate_config(&config);
    if !report.warnings.is_empty() {
        warn!("Configuration warnings:");
        for warning in &report.warnings {
            warn!(field = %warning.field, message = %warning.message);
        }
    }
    if !report.is_valid() {
        error!(
            error_count = report.errors.len(),
            "Configuration validation failed"
        );
        for err in &report.errors {
            error!("{}", err);
        }
        anyhow::bail!("Cannot start greekd due to configuration errors");
    }

    let sources = selected_sources(&config, &only);
    if sources.is_empty() {
        anyhow::bail!("No enabled source left to stream from");
    }

    if config.metrics.enabled {
        init_metrics(&config.metrics.address())?;
    }

    let store = open_store(&config, dry_run).await?;
    let buffer = BufferLog::open(&config.writer.buffer_path)
        .await
        .with_context(|| format!("Failed to open buffer at {}", config.writer.buffer_path))?;

    let shutdown = ShutdownController::with_ctrl_c();

    // Stage 1: stream sessions feeding the shared inbound channel
    let (mut supervisor, inbound_rx) = StreamSupervisor::new(
        supervisor_settings(&config),
        config.subscription_set(),
        shutdown.child_token(),
    );
    for (source, source_config) in &sources {
        let session = session_config(&config, *source, source_config)?;
        match source {
            Source::Tastytrade => supervisor.spawn_session(
                session,
                TastytradeTransport::new(
                    source_config.url.as_str(),
                    source_config.token.as_str(),
                    Duration::from_secs(source_config.heartbeat_interval_seconds),
                ),
            )?,
            Source::Ibkr => supervisor.spawn_session(
                session,
                IbkrTransport::new(source_config.url.as_str(), source_config.token.as_str()),
            )?,
        }
    }

    // Stage 2: normalizer between the inbound channel and the writer
    let (snapshot_tx, snapshot_rx) = mpsc::channel(config.normalizer.output_capacity.max(1));
    let processor =
        NormalizationProcessor::new(inbound_rx, snapshot_tx, config.normalizer.dedup_history);

    // Stage 3: batch writer
    let writer = BatchWriter::new(writer_settings(&config), store, buffer, snapshot_rx)?;

    let board = common::StatusBoard::new(
        supervisor.status_receivers(),
        processor.stats(),
        writer.status(),
    );

    // The status server outlives the pipeline so the final flush stays observable
    let status_token = CancellationToken::new();
    let status_task = if config.status.enabled {
        let port = status_port.unwrap_or(config.status.port);
        let server = StatusServer::new(config.status.host.as_str(), port, board)
            .with_subscriptions(supervisor.subscription_handle());
        let token = status_token.clone();
        Some(tokio::spawn(async move { server.run(token).await }))
    } else {
        debug!("Status server disabled");
        None
    };

    let normalizer_task = tokio::spawn(processor.run());
    let mut writer_task = tokio::spawn(writer.run());

    info!(
        sources = ?sources.iter().map(|(s, _)| s.as_str()).collect::<Vec<_>>(),
        subscriptions = config.subscriptions.len(),
        dry_run,
        "greekd running"
    );

    let early_exit = tokio::select! {
        _ = shutdown.wait_for_shutdown() => None,
        result = &mut writer_task => Some(result),
    };
    if early_exit.is_some() {
        error!("Batch writer stopped unexpectedly; shutting down");
    }

    // Sessions stop first; the normalizer and writer drain behind them
    shutdown.shutdown();
    supervisor.join().await;
    info!("Stream sessions stopped");

    if let Err(e) = normalizer_task.await {
        error!(%e, "Normalization task failed");
    }

    let writer_result = match early_exit {
        Some(result) => result,
        None => writer_task.await,
    };

    status_token.cancel();
    if let Some(task) = status_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%e, "Status server ended with an error"),
            Err(e) => warn!(%e, "Status server task failed"),
        }
    }

    match writer_result {
        Ok(Ok(())) => {
            info!("greekd stopped");
            Ok(())
        }
        Ok(Err(e)) => Err(e).context("Batch writer failed"),
        Err(e) => Err(e).context("Batch writer task failed"),
    }
}

/// Enabled sources, narrowed to `only` when it is non-empty
fn selected_sources<'a>(
    config: &'a MasterConfig,
    only: &[SourceArg],
) -> Vec<(Source, &'a SourceConfig)> {
    config
        .sources
        .enabled()
        .into_iter()
        .filter(|(source, _)| only.is_empty() || only.iter().any(|a| a.as_str() == source.as_str()))
        .collect()
}

fn supervisor_settings(config: &MasterConfig) -> SupervisorSettings {
    SupervisorSettings {
        inbound_capacity: config.supervisor.inbound_capacity,
        push_timeout: Duration::from_millis(config.supervisor.push_timeout_ms),
        overflow_capacity: config.supervisor.overflow_capacity,
    }
}

fn session_config(
    config: &MasterConfig,
    source: Source,
    source_config: &SourceConfig,
) -> Result<SessionConfig> {
    let mut session = SessionConfig::new(source, source_config.account_id.as_str());
    session.connect_timeout = Duration::from_secs(source_config.connect_timeout_seconds);
    session.heartbeat_interval = Duration::from_secs(source_config.heartbeat_interval_seconds);
    session.heartbeat_timeout_multiple = source_config.heartbeat_timeout_multiple;
    session.backoff = BackoffSchedule::from_secs(&config.supervisor.backoff_seconds)?;
    session.maintenance = source_config
        .maintenance_window(source)
        .map(|w| MaintenanceWindow::parse(&w.timezone, &w.start, &w.end, &w.resume_at))
        .transpose()
        .with_context(|| format!("Invalid maintenance window for {}", source))?;
    Ok(session)
}

fn writer_settings(config: &MasterConfig) -> WriterSettings {
    let writer = &config.writer;
    WriterSettings {
        batch_size: writer.batch_size,
        flush_interval: Duration::from_millis(writer.flush_interval_ms),
        failure_threshold: writer.failure_threshold,
        probe_interval: Duration::from_secs(writer.probe_interval_seconds),
        write_timeout: Duration::from_millis(writer.write_timeout_ms),
        latency_target: Duration::from_millis(writer.latency_target_ms),
        latency_window: writer.latency_window,
    }
}

async fn open_store(config: &MasterConfig, dry_run: bool) -> Result<Arc<dyn GreekStore>> {
    if dry_run || config.storage.storage_type == "memory" {
        warn!("Using the in-memory store; nothing will be persisted");
        return Ok(Arc::new(MemoryGreekStore::new()));
    }

    let pg = config
        .storage
        .postgres
        .as_ref()
        .context("storage.postgres is required for the postgres store")?;
    let store = PostgresGreekStore::connect(
        &pg.url,
        pg.max_connections,
        Duration::from_secs(pg.connection_timeout_seconds),
    )
    .await?;
    if pg.run_migrations {
        store.run_migrations().await?;
    }
    Ok(Arc::new(store))
}

async fn validate_command<P: AsRef<Path>>(config_path: P) -> Result<()> {
    info!(path = ?config_path.as_ref(), "Validating configuration");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            error!(%e, "Failed to load configuration");
            anyhow::bail!(e);
        }
    };

    let report = validate_config(&config);

    println!("\n=== Configuration Validation Report ===\n");

    if !report.defaults_applied.is_empty() {
        println!("Defaults Applied ({}):", report.defaults_applied.len());
        for default in &report.defaults_applied {
            println!("  [info] {} = {}", default.field, default.value);
        }
        println!();
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            println!("  [warn] [{}] {}", warning.field, warning.message);
        }
        println!();
    }

    if !report.errors.is_empty() {
        println!("Errors ({}):", report.errors.len());
        for err in &report.errors {
            println!("  [error] {}", err);
        }
        println!();
        anyhow::bail!("Configuration validation failed");
    }

    println!("[ok] Configuration is valid!");
    println!();
    println!("Service: {}", config.service.name);
    let enabled: Vec<&str> = config
        .sources
        .enabled()
        .iter()
        .map(|(s, _)| s.as_str())
        .collect();
    println!("Sources: {}", enabled.join(", "));
    println!("Subscriptions: {}", config.subscriptions.len());
    println!("Storage: {}", config.storage.storage_type);
    println!("Buffer: {}", config.writer.buffer_path);
    if config.status.enabled {
        println!("Status: http://{}", config.status.address());
    }

    Ok(())
}

async fn init_command<P: AsRef<Path>>(output_path: P) -> Result<()> {
    let output_path = output_path.as_ref();
    info!(?output_path, "Initializing new configuration file");

    let config = generate_default_config();

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {:?}", parent))?;
    }

    save_config(&config, output_path)?;

    println!("[ok] Configuration file created successfully!");
    println!();
    println!("Location: {:?}", output_path);
    println!();
    println!("This configuration includes:");
    println!("  - Tastytrade and IBKR sources (IBKR with its daily maintenance window)");
    println!("  - Batch writer defaults (50 records / 1s, circuit opens after 3 failures)");
    println!("  - PostgreSQL storage");
    println!();
    println!("Next steps:");
    println!("  1. Add subscriptions for the contracts you hold");
    println!("  2. Set TASTYTRADE_STREAMER_TOKEN, IBKR_SESSION_TOKEN, the account ids and DATABASE_URL");
    println!(
        "  3. Run 'greekd validate --config {:?}' to check configuration",
        output_path
    );
    println!(
        "  4. Run 'greekd start --config {:?}' to start streaming",
        output_path
    );

    Ok(())
}

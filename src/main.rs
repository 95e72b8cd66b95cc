// ABOUTME: Main entry point for the relaygate gateway process
// ABOUTME: Parses the CLI, initializes logging and metrics, runs background tasks until Ctrl-C

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use relaygate::{
    admin::{self, AdminState},
    config::{Config, LoggingConfig},
    gateway::LoggingHandler,
    server::ServerState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "info,relaygate=debug,relaygate_core=debug";

#[derive(Parser, Debug)]
#[command(name = "relaygate", version, about = "Multi-tenant chat gateway")]
struct Cli {
    /// Path to config.toml, bypassing the usual search
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the gateway (default)
    Start,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<Config> {
    match &cli.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

/// Install the global subscriber. The returned guard flushes the file
/// writer and must live as long as the process.
fn init_logging(logging: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let (file_layer, guard) = match &logging.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir))?;
            let appender = tracing_appender::rolling::daily(dir, "relaygate.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, text_layer) = if logging.json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text_layer)
        .with(json_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    match cli.command.unwrap_or(Command::Start) {
        Command::CheckConfig => {
            println!("{:#?}", config);
            println!("Configuration OK");
            Ok(())
        }
        Command::Start => run_start(config).await,
    }
}

async fn run_start(config: Config) -> Result<()> {
    let _log_guard = init_logging(&config.logging)?;

    tracing::info!(
        instance_id = %config.instance.id,
        version = %config.instance.version,
        redis = config.redis.is_some(),
        workers = config.pool.workers,
        queue_capacity = config.pool.queue_capacity,
        "Starting relaygate"
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    relaygate_core::metrics::register_metrics();

    let state = Arc::new(ServerState::initialize(config, Arc::new(LoggingHandler)).await?);
    let cancel = CancellationToken::new();
    let mut handles = state.spawn_background_tasks(&cancel);

    if state.config.admin.enabled {
        let admin_state = AdminState {
            server: Arc::clone(&state),
            metrics: Some(metrics_handle),
        };
        let addr = state.config.admin_addr();
        let token = cancel.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = admin::serve(&addr, admin_state, token).await {
                tracing::error!(error = %e, "Admin server failed");
            }
        }));
    }

    tracing::info!("Gateway ready");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutdown requested");

    cancel.cancel();
    for result in futures_util::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::warn!(error = %e, "Background task ended abnormally");
        }
    }
    state.shutdown().await;

    tracing::info!("Shutdown complete");
    Ok(())
}

use anyhow::{Context, Result};
use chrono::Local;
use edge_receiver::config::LoggingConfig;
use edge_receiver::{decoder, start_api_server, AppState, Config, IngestPipeline, StatsRegistry};
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    // The log directory has to exist before the file layer opens it
    ensure_directories(&config)?;

    // Initialize logging
    init_tracing(&config.logging)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.service.worker_threads)
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?;

    let result = runtime.block_on(run(config));
    if let Err(ref e) = result {
        error!(error = %e, "Receiver failed");
    }
    result
}

async fn run(config: Config) -> Result<()> {
    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        address = %config.listen_addr(),
        workers = config.service.worker_threads,
        "Starting edge receiver"
    );

    // Initialize metrics
    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let stats = Arc::new(StatsRegistry::new());

    let decoder = decoder::from_kind(config.decoder.kind);
    if decoder.is_none() {
        warn!("Inference decoding disabled, metadata is stored as received");
    }

    let pipeline = Arc::new(IngestPipeline::new(
        config.storage.image_dir.clone(),
        config.storage.meta_dir.clone(),
        decoder,
        stats.clone(),
    ));

    let state = AppState {
        pipeline,
        stats,
        image_dir: config.storage.image_dir.clone(),
        meta_dir: config.storage.meta_dir.clone(),
        legacy_always_ok: config.api.legacy_always_ok,
    };

    if config.api.legacy_always_ok {
        warn!("Failed uploads will be answered with transport status 200");
    }

    start_api_server(state, &config.api, shutdown_signal()).await?;

    info!("Edge receiver stopped");

    Ok(())
}

/// Create the storage roots and the log directory
fn ensure_directories(config: &Config) -> Result<()> {
    for dir in [
        &config.storage.image_dir,
        &config.storage.meta_dir,
        &config.logging.dir,
    ] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Console output plus a daily file under the log directory
fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?
        .add_directive("hyper=warn".parse()?)
        .add_directive("tower_http=warn".parse()?);

    let log_path = config
        .dir
        .join(format!("receiver_{}.log", Local::now().format("%Y%m%d")));
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(log_file));

    let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer().pretty()).init();
    }

    Ok(())
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

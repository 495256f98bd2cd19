//! pulsed: the Pulse daemon.
//!
//! Single binary that assembles the metrics service:
//! - Metric store (redb) and its blocking worker pool
//! - Rollup and retention maintenance
//! - REST API, live stream gateway and self-metrics
//!
//! # Usage
//!
//! ```text
//! pulsed serve --config /etc/pulse/pulse.toml --port 8080 --data-dir /var/lib/pulse
//! pulsed check-config --config /etc/pulse/pulse.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pulse_api::{ApiState, build_router};
use pulse_core::PulseConfig;
use pulse_metrics::ServiceMetrics;
use pulse_store::{Maintenance, MaintenanceReport, MetricStore, ReportHook, StoreOptions, StorePool};

#[derive(Parser)]
#[command(name = "pulsed", about = "Pulse metrics daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server.
    Serve {
        /// Path to pulse.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory (overrides `storage.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
    /// Parse and validate a config file, then print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pulsed=debug,pulse=debug"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<PulseConfig> {
    match path {
        Some(path) => PulseConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(PulseConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let mut config = load_config(config.as_ref())?;
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.storage.data_dir = data_dir;
            }
            config.validate()?;
            serve(config).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(Some(&config))?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

/// Map maintenance outcomes onto the service counters.
fn report_hook(metrics: Arc<ServiceMetrics>) -> ReportHook {
    Arc::new(move |report| match report {
        MaintenanceReport::Rollups { buckets, .. } => metrics.record_rollups(*buckets),
        MaintenanceReport::Retention(summary) => {
            metrics.record_eviction(summary.points_evicted, summary.partitions_dropped)
        }
        MaintenanceReport::Failed { .. } => metrics.record_maintenance_failure(),
    })
}

async fn serve(config: PulseConfig) -> anyhow::Result<()> {
    info!("Pulse daemon starting");

    // ── Storage ────────────────────────────────────────────────

    std::fs::create_dir_all(&config.storage.data_dir)
        .with_context(|| format!("creating {}", config.storage.data_dir.display()))?;
    let db_path = config.storage.data_dir.join("pulse.redb");
    let store = MetricStore::open(&db_path, StoreOptions::from_config(&config))?;
    info!(path = ?db_path, "metric store opened");

    let pool = StorePool::new(store, config.storage.workers);
    info!(workers = config.storage.workers, "storage pool initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── API state ──────────────────────────────────────────────

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}", config.server.bind))?;
    let state = ApiState::new(pool.clone(), config.clone(), shutdown_rx.clone());

    // ── Background maintenance ─────────────────────────────────

    let maintenance = Maintenance::new(
        pool,
        Duration::from_secs(config.rollup.interval_secs),
        Duration::from_secs(config.retention.interval_secs),
        config.rollup.batch_size,
    )
    .with_report_hook(report_hook(Arc::clone(&state.metrics)));
    let maintenance_shutdown = shutdown_rx.clone();
    let maintenance_handle = tokio::spawn(async move {
        maintenance.run(maintenance_shutdown).await;
    });
    info!(
        rollup_interval = config.rollup.interval_secs,
        retention_interval = config.retention.interval_secs,
        "maintenance started"
    );

    // ── API server ─────────────────────────────────────────────

    let stream_sessions = state.clone();
    let router = build_router(state);
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C. Stream sessions and maintenance watch the
    // same channel.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Upgraded stream sockets are not owned by the server; give them the
    // close timeout to flush their queues and send a Close frame.
    let drain_limit = config.stream.close_timeout() + Duration::from_secs(1);
    if !stream_sessions.drain_sessions(drain_limit).await {
        warn!(
            open = stream_sessions.sessions.len(),
            "stream sessions still open after drain timeout"
        );
    }

    // Wait for background tasks.
    let _ = maintenance_handle.await;

    info!("Pulse daemon stopped");
    Ok(())
}

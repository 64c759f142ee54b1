//! Overlay metadata service entry point

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use overlay::{api::HttpApi, config::OverlayConfig, transfer::InMemoryTransfer, Overlay};

/// Overlay - superpeer metadata service
#[derive(Parser, Debug)]
#[command(name = "overlay")]
#[command(about = "Superpeer metadata overlay: chunk placement, names and migration")]
struct Args {
    /// YAML configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Cluster name
    #[arg(short, long)]
    cluster: Option<String>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// HTTP API listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// Heartbeat timeout (seconds)
    #[arg(long)]
    heartbeat_timeout: Option<i64>,

    /// Backup copies per chunk
    #[arg(long)]
    backup_count: Option<usize>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, config: &mut OverlayConfig) {
        if let Some(cluster) = self.cluster {
            config.cluster.name = cluster;
        }
        if let Some(data_dir) = self.data_dir {
            config.cluster.data_dir = data_dir;
        }
        if let Some(addr) = self.http_addr {
            config.http.addr = addr;
        }
        if let Some(timeout) = self.heartbeat_timeout {
            config.registry.heartbeat_timeout_secs = timeout;
        }
        if let Some(count) = self.backup_count {
            config.placement.backup_count = count;
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OverlayConfig::from_file(path)?,
        None => OverlayConfig::default(),
    };
    args.apply(&mut config);

    // Initialize logging
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting overlay metadata service...");
    info!("  Cluster: {}", config.cluster.name);
    info!("  Data dir: {:?}", config.cluster.data_dir);
    info!("  HTTP API: {}", config.http.addr);
    info!("  Backups per chunk: {}", config.placement.backup_count);

    // No storage engine attached; payload moves are recorded in memory
    let transfer = Arc::new(InMemoryTransfer::new());
    let overlay = Arc::new(Overlay::new(config.clone(), transfer).await?);

    // Start background tasks
    let _detector_handle = overlay.clone().start_failure_detector();
    let _save_handle = if config.cluster.save_interval_secs > 0 {
        Some(
            overlay
                .clone()
                .start_periodic_save(config.cluster.save_interval_secs),
        )
    } else {
        None
    };

    let summary = overlay.metadata_summary(overlay::metadata::SummaryScope::All)?;
    info!(
        "Overlay ready: {} superpeer(s), {} chunk(s)",
        summary.len(),
        summary.iter().map(|s| s.chunk_count).sum::<usize>()
    );

    // Start HTTP API
    let http_api = HttpApi::new(overlay.clone());
    let app = http_api.router();

    let listener = tokio::net::TcpListener::bind(&config.http.addr).await?;
    info!("HTTP API listening on {}", config.http.addr);

    axum::serve(listener, app).await?;

    overlay.save().await?;
    Ok(())
}

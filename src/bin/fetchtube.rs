#![forbid(unsafe_code)]

//! HTTP server entry point.
//!
//! Settings come from flags, then the environment, then `.env`, then built-in
//! defaults. Downloads run through `yt-dlp`; nothing is persisted beyond the
//! files in the download folder.

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use fetchtube::config::{Overrides, Settings, resolve_settings};
use fetchtube::extractor::YtDlpExtractor;
use fetchtube::security::ensure_not_root;
use fetchtube::server::router;
use fetchtube::service::{DownloadService, ServiceConfig};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fetchtube", version, about = "Media download orchestration server")]
struct Args {
    /// Address to bind, e.g. 0.0.0.0.
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Folder where finished downloads are written.
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Number of downloads allowed to run at once.
    #[arg(long)]
    workers: Option<usize>,
    /// Path to the yt-dlp executable.
    #[arg(long)]
    ytdlp_bin: Option<PathBuf>,
    /// Alternate env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl From<Args> for Overrides {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            download_dir: args.download_dir,
            workers: args.workers,
            ytdlp_bin: args.ytdlp_bin,
            env_path: args.env_file,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    ensure_not_root("fetchtube")?;

    let settings = resolve_settings(args.into()).context("loading settings")?;
    std::fs::create_dir_all(&settings.download_dir)
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;

    let extractor = build_extractor(&settings);
    let service = DownloadService::new(
        ServiceConfig {
            download_dir: settings.download_dir.clone(),
            workers: settings.workers,
            metadata_ttl: settings.metadata_ttl,
            retention: settings.retention,
            sweep_interval: settings.sweep_interval,
        },
        Arc::new(extractor),
    );
    service.start_sweeper();

    let bind_addr = settings.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(
        address = %bind_addr,
        download_dir = %settings.download_dir.display(),
        workers = settings.workers,
        "fetchtube listening"
    );

    axum::serve(listener, router(service.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    service.shutdown().await;
    info!("fetchtube stopped");
    Ok(())
}

fn build_extractor(settings: &Settings) -> YtDlpExtractor {
    match settings.provision_cookies() {
        Ok(Some(path)) => info!(path = %path.display(), "using cookies file"),
        Ok(None) => warn!("no cookies configured; requests may hit bot detection"),
        Err(err) => warn!(error = %format!("{err:#}"), "failed to provision cookies"),
    }
    YtDlpExtractor::new(&settings.ytdlp_bin, &settings.download_dir)
        .with_cookies(&settings.cookies_file)
}

async fn shutdown_signal() {
    // Without a handler there is no graceful path; keep serving until killed.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

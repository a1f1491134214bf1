//! s3cask -- S3-compatible object storage front-end.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use s3cask::storage::cask::CaskStore;
use s3cask::storage::dir::DirStore;
use s3cask::storage::Storage;
use s3cask::S3Service;

/// Command-line arguments for the s3cask server.
#[derive(Parser, Debug)]
#[command(name = "s3cask", version, about = "S3-compatible object storage server")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "s3cask.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = s3cask::config::load_config(&cli.config)
        .with_context(|| format!("error loading configuration from {}", cli.config))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .init();

    let bind_addr = cli
        .bind
        .unwrap_or_else(|| format!("{}:{}", config.server.host, config.server.port));

    let storage: Arc<dyn Storage> = match config.storage.backend.as_str() {
        "cask" => {
            let cask = config.storage.cask.as_ref().ok_or_else(|| {
                anyhow::anyhow!("storage.backend is 'cask' but storage.cask section is missing")
            })?;
            let backend = CaskStore::new(&cask.master_url, &cask.db_dir)?;
            info!(
                "cask storage backend initialized: master={} db_dir={}",
                cask.master_url, cask.db_dir
            );
            Arc::new(backend)
        }
        _ => {
            let root = &config.storage.dir.root;
            let backend = DirStore::new(root)?;
            info!("dir storage backend initialized at {root}");
            Arc::new(backend)
        }
    };

    let svc = Arc::new(S3Service::new(&config.server.service_host, storage));
    let app = s3cask::server::app(svc.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("error binding {bind_addr}"))?;
    info!(
        "s3cask listening on {bind_addr} as {}",
        svc.service_host
    );

    // On SIGTERM/SIGINT: stop accepting connections, cancel in-flight
    // blob-cluster retries, and wait for ongoing requests.
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(svc.shutdown.clone()))
        .await?;

    info!("s3cask shut down");
    Ok(())
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then trigger graceful shutdown.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("received SIGTERM, shutting down");
        },
    }
    token.cancel();
}

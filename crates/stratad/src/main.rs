//! `stratad` — the strata build-artifact cache.
//!
//! Two entry points:
//!
//! ```text
//! stratad serve --work-dir ~/.strata --bucket s3://team-cache   # daemon, foreground
//! stratad prog --port 4477                                      # toolchain adapter on stdin/stdout
//! ```
//!
//! The daemon owns the cache backend and serves it on loopback HTTP; each
//! toolchain build launches a short-lived `prog` process that speaks the
//! cache-program protocol on its stdio and forwards everything to the
//! daemon. Process management (daemonize/stop/status) is left to the
//! embedding environment.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use strata_blob::{BlobBackend, BlobConfig};
use strata_daemon::{Client, ClientConfig, DaemonHandler, Server};
use strata_proto::CacheProg;
use strata_store::{CacheBackend, LocalStore};
use strata_types::metrics::Metrics;

const DEFAULT_PORT: u16 = 4477;

#[derive(Parser)]
#[command(name = "stratad", version, about = "strata build-artifact cache")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the cache daemon in the foreground.
    Serve {
        /// Loopback port to listen on.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
        /// Directory for the local cache and bundle copies.
        #[arg(long, default_value = ".strata")]
        work_dir: PathBuf,
        /// Remote bucket URL (s3://…, gs://…, azure://…, file://…).
        /// Without it the cache is local-only.
        #[arg(long)]
        bucket: Option<String>,
        /// Background upload workers for the remote bucket.
        #[arg(long, default_value_t = 50)]
        upload_concurrency: usize,
    },
    /// Speak the cache-program protocol on stdin/stdout, forwarding to a
    /// running daemon.
    Prog {
        /// Port the daemon listens on.
        #[arg(long, default_value_t = DEFAULT_PORT)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout may carry the cache-program protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve {
            port,
            work_dir,
            bucket,
            upload_concurrency,
        } => serve(port, work_dir, bucket, upload_concurrency).await,
        Command::Prog { port } => prog(port).await,
    }
}

async fn serve(
    port: u16,
    work_dir: PathBuf,
    bucket: Option<String>,
    upload_concurrency: usize,
) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let config_snapshot = serde_json::json!({
        "port": port,
        "work_dir": work_dir,
        "bucket": bucket,
        "upload_concurrency": upload_concurrency,
    });

    let backend: Arc<dyn CacheBackend> = match bucket {
        Some(url) => Arc::new(
            BlobBackend::open(
                BlobConfig {
                    url,
                    upload_concurrency,
                    work_dir: work_dir.clone(),
                },
                Arc::clone(&metrics),
            )
            .await
            .context("failed to open blob backend")?,
        ),
        None => Arc::new(
            LocalStore::open(&work_dir)
                .await
                .context("failed to open local cache")?,
        ),
    };

    let server = Server::new(Arc::clone(&backend), metrics, config_snapshot);
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("failed to bind 127.0.0.1:{port}"))?;
    server.serve(listener).await?;

    backend.close().await?;
    info!("daemon stopped");
    Ok(())
}

async fn prog(port: u16) -> anyhow::Result<()> {
    let client = Client::new(ClientConfig { daemon_port: port })?;
    let handler = Arc::new(DaemonHandler::new(client));
    CacheProg::new(handler)
        .run(tokio::io::stdin(), tokio::io::stdout())
        .await?;
    Ok(())
}

//! snapblock NBD server
//!
//! Serves one EBS snapshot as a read-only NBD export on a Unix socket.
//! Blocks are fetched on demand through the EBS direct API and cached in
//! memory; block tokens are refreshed in the background.

mod nbd;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use snapblock_block::{Backend, BackendConfig, DEFAULT_CACHE_BLOCKS, SnapshotBackend};
use snapblock_ebs::{EbsClient, EbsConfig};
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::nbd::NbdServer;

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "snapblock-nbd",
    about = "Serve an EBS snapshot as a read-only NBD export"
)]
struct Args {
    /// Snapshot to serve (snap-...)
    snapshot_id: String,

    /// AWS region of the snapshot
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    region: String,

    /// EBS direct API endpoint (defaults to the regional endpoint)
    #[arg(long)]
    endpoint: Option<String>,

    /// AWS profile from the shared config and credentials files
    #[arg(long, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Unix socket to listen on [default: $XDG_RUNTIME_DIR/nbd.sock, else /tmp/nbd.sock]
    #[arg(long)]
    socket: Option<PathBuf>,

    /// NBD export name
    #[arg(long, default_value = "ebs")]
    export_name: String,

    /// Number of snapshot blocks kept in memory
    #[arg(long, default_value_t = DEFAULT_CACHE_BLOCKS)]
    cache_blocks: u64,

    /// Refresh block tokens this many seconds before they expire
    #[arg(long, default_value_t = 300)]
    refresh_margin_secs: u64,

    /// Page size for block listings (service default when unset)
    #[arg(long)]
    list_page_size: Option<u32>,

    /// Log level (trace / debug / info / warn / error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn socket_path(&self) -> PathBuf {
        self.socket.clone().unwrap_or_else(|| {
            std::env::var_os("XDG_RUNTIME_DIR")
                .map_or_else(|| PathBuf::from("/tmp"), PathBuf::from)
                .join("nbd.sock")
        })
    }

    fn ebs_config(&self) -> EbsConfig {
        EbsConfig {
            endpoint: self.endpoint.clone(),
            profile: self.profile.clone(),
            list_page_size: self.list_page_size,
            ..EbsConfig::for_region(&self.region)
        }
    }

    fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            cache_capacity: self.cache_blocks,
            refresh_margin: Duration::from_secs(self.refresh_margin_secs),
        }
    }
}

/// Remove a socket file left behind by an earlier run
fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            info!("Removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove stale socket {}", path.display())),
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting snapblock NBD server for {}", args.snapshot_id);

    // ── EBS client ────────────────────────────────────────────────────────────
    let client = EbsClient::new(args.ebs_config()).await;
    client
        .check_credentials()
        .await
        .context("resolve AWS credentials")?;

    // ── Backend ───────────────────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let backend = Arc::new(
        SnapshotBackend::new(
            &shutdown,
            Arc::new(client),
            args.snapshot_id.clone(),
            args.backend_config(),
        )
        .await
        .with_context(|| format!("open snapshot {}", args.snapshot_id))?,
    );

    // ── NBD listener ──────────────────────────────────────────────────────────
    let socket = args.socket_path();
    remove_stale_socket(&socket)?;
    let listener = UnixListener::bind(&socket)
        .with_context(|| format!("bind NBD socket {}", socket.display()))?;
    info!("NBD server on {}", socket.display());

    let server = Arc::new(NbdServer::new(
        args.export_name.clone(),
        Arc::clone(&backend) as Arc<dyn Backend>,
    ));

    let outcome = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            info!("Received ctrl-c, shutting down");
            res.context("wait for ctrl-c")
        }
        err = backend.terminated() => {
            Err(anyhow::Error::new(err).context("snapshot backend terminated"))
        }
        res = Arc::clone(&server).serve(listener, shutdown.clone()) => res,
    };

    // ── Shutdown ──────────────────────────────────────────────────────────────
    shutdown.cancel();
    if let Err(e) = backend.close(&CancellationToken::new()).await {
        warn!("Error closing backend: {e}");
    }
    if let Err(e) = std::fs::remove_file(&socket) {
        warn!("Failed to remove socket {}: {e}", socket.display());
    }

    outcome
}

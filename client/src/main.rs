use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::rustls::pki_types::CertificateDer;
use tracing::{error, info};

use wormhole_client::config::WormholeConfig;
use wormhole_client::dashboard;
use wormhole_client::session::{Session, SessionConfig};
use wormhole_shared::protocol::Proto;

#[derive(Parser)]
#[command(name = "wormhole")]
#[command(version = "0.1.0")]
#[command(about = "Expose local services through a public wormhole endpoint", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Rendezvous server address
    #[arg(short, long, default_value = "wormhole.dyastin.dev:443", global = true)]
    address: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP service
    Http {
        #[command(flatten)]
        opts: TunnelOpts,
    },
    /// Expose a local TCP service
    Tcp {
        #[command(flatten)]
        opts: TunnelOpts,
    },
    /// Run every tunnel defined in wormhole.yml
    Start {
        /// Path to the configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct TunnelOpts {
    /// Subdomain to register
    #[arg(short, long)]
    name: String,

    /// Local address to forward to; an empty host means loopback
    #[arg(short, long)]
    target_address: String,

    /// The local target speaks TLS with a self-signed certificate
    #[arg(long)]
    target_tls: bool,

    /// Stream tunnel metrics and render the dashboard
    #[arg(long)]
    metrics: bool,

    /// Extra PEM trust root(s) for the rendezvous server
    #[arg(long)]
    ca: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    match cli.command {
        Commands::Http { opts } => run_tunnel(cli.address, Proto::Http, opts).await,
        Commands::Tcp { opts } => run_tunnel(cli.address, Proto::Tcp, opts).await,
        Commands::Start { config } => run_all(config).await,
    }
}

/// Run a single tunnel until it ends or Ctrl+C.
async fn run_tunnel(address: String, proto: Proto, opts: TunnelOpts) -> Result<()> {
    let extra_roots = match &opts.ca {
        Some(path) => load_roots(path)?,
        None => Vec::new(),
    };

    let config = SessionConfig {
        server_addr: address,
        proto,
        name: opts.name,
        target_addr: opts.target_address,
        target_tls: opts.target_tls,
        with_metrics: opts.metrics,
        extra_roots,
    };

    let mut dashboard_task = None;
    let metrics_tx = if opts.metrics {
        let (tx, rx) = mpsc::channel(64);
        let title = format!("wormhole '{}'", config.name);
        dashboard_task = Some(tokio::spawn(dashboard::run(rx, title)));
        Some(tx)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutting down");
        let _ = shutdown_tx.send(());
    });

    let mut session = Session::new(config, metrics_tx);
    let result = session.run(shutdown_rx).await.context("tunnel failed");

    if let Some(task) = dashboard_task {
        task.abort();
    }
    result
}

/// Run every tunnel from the configuration file until Ctrl+C.
async fn run_all(path: Option<PathBuf>) -> Result<()> {
    let path = match path {
        Some(path) => path,
        None => WormholeConfig::find_config()
            .context("no wormhole.yml found; pass --config or create one")?,
    };
    let config = WormholeConfig::load(&path)?;
    info!(
        "starting {} tunnel(s) from {}",
        config.tunnels.len(),
        path.display()
    );

    let mut stops = Vec::new();
    let mut handles = Vec::new();
    for tunnel in &config.tunnels {
        let session_config = SessionConfig {
            server_addr: config.address.clone(),
            proto: tunnel.proto()?,
            name: tunnel.name.clone(),
            target_addr: tunnel.target_address.clone(),
            target_tls: tunnel.target_tls,
            with_metrics: tunnel.metrics,
            extra_roots: Vec::new(),
        };

        // In multi-tunnel mode metrics become log lines, not a dashboard.
        let metrics_tx = if tunnel.metrics {
            let (tx, mut rx) = mpsc::channel(64);
            let label = tunnel.name.clone();
            tokio::spawn(async move {
                while let Some(sample) = rx.recv().await {
                    info!("[{label}] {}", dashboard::summary(&sample));
                }
            });
            Some(tx)
        } else {
            None
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        stops.push(stop_tx);
        let name = tunnel.name.clone();
        let mut session = Session::new(session_config, metrics_tx);
        handles.push(tokio::spawn(async move {
            match session.run(stop_rx).await {
                Ok(()) => info!("tunnel '{name}' closed"),
                Err(e) => error!("tunnel '{name}' failed: {e}"),
            }
        }));
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down all tunnels");
    for stop in stops {
        let _ = stop.send(());
    }
    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

/// Read PEM certificates to trust for the rendezvous leg.
fn load_roots(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .with_context(|| format!("failed to read CA file: {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to parse CA file: {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

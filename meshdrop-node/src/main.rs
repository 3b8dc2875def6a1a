// Meshdrop node: hosts or joins a star mesh and exchanges files over TCP.

mod cli;
mod config;
mod files;
mod ticket;
mod transport;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use meshdrop_core::{MeshCore, PeerId};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cli::{Args, Command};
use crate::files::DiskFile;
use crate::ticket::Ticket;
use crate::transport::{Node, NodeOptions};

/// Time given to queued goodbye frames before the runtime goes away.
const SHUTDOWN_FLUSH: Duration = Duration::from_millis(500);

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.log_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut cfg = config::load(args.config.as_deref())?;
    args.apply(&mut cfg);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(args, cfg))
}

async fn run(args: Args, cfg: config::Config) -> anyhow::Result<()> {
    let local = PeerId::generate();
    let core = match &args.command {
        Command::Host => MeshCore::coordinator(local.clone(), cfg.mesh.clone()),
        Command::Join { ticket } => {
            MeshCore::participant(local.clone(), ticket.peer.clone(), cfg.mesh.clone())
        }
    };
    let node = Node::new(
        core,
        NodeOptions {
            listen_port: cfg.listen_port,
            download_dir: cfg.download_dir.clone(),
            auto_download: args.auto_download,
        },
    );

    let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port))
        .await
        .with_context(|| format!("cannot listen on port {}", cfg.listen_port))?;
    node.start(listener).await?;

    if let Some(name) = &cfg.name {
        node.set_display_name(name).await;
    }

    for path in &args.shares {
        let file = DiskFile::open(path).with_context(|| format!("cannot share {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let fingerprint = node.share(&name, Arc::new(file)).await;
        info!(event = "share_queued", fingerprint = %fingerprint, path = %path.display(), "File offered");
    }

    match &args.command {
        Command::Host => {
            let ticket = Ticket {
                peer: local,
                addr: (args.advertise, cfg.listen_port).into(),
            };
            info!(event = "hosting", ticket = %ticket, "Hosting session");
            println!("{}", ticket);
        }
        Command::Join { ticket } => {
            node.add_peer(ticket.peer.clone(), ticket.addr).await;
            node.connect(&ticket.peer).await;
        }
    }

    tokio::select! {
        r = shutdown_signal() => r?,
        _ = node.session_ended() => {
            warn!(event = "exiting", "Session over, exiting");
        }
    }
    node.shutdown().await;
    tokio::time::sleep(SHUTDOWN_FLUSH).await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

//! Command-line arguments. Values given here win over the config file and environment.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::ticket::Ticket;

/// Meshdrop - share files across a small star mesh.
#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// TCP port for incoming links.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Display name to announce.
    #[arg(long)]
    pub name: Option<String>,

    /// Directory for finished downloads.
    #[arg(long)]
    pub download_dir: Option<PathBuf>,

    /// File to share once the mesh is up (repeatable).
    #[arg(long = "share", value_name = "PATH")]
    pub shares: Vec<PathBuf>,

    /// Download every file another peer announces.
    #[arg(long)]
    pub auto_download: bool,

    /// Address put into the printed join ticket.
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise: IpAddr,

    /// Config file (default: ~/.config/meshdrop/config.toml, then /etc/meshdrop/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Host a session as coordinator and print its join ticket.
    Host,
    /// Join the session behind a ticket printed by `host`.
    Join {
        /// `peerId@host:port`
        ticket: Ticket,
    },
}

impl Args {
    /// Fold CLI overrides into the loaded config.
    pub fn apply(&self, c: &mut Config) {
        if let Some(port) = self.port {
            c.listen_port = port;
        }
        if let Some(dir) = &self.download_dir {
            c.download_dir = dir.clone();
        }
        if let Some(name) = &self.name {
            c.name = Some(name.clone());
        }
    }

    /// Tracing filter for the chosen verbosity; `RUST_LOG` wins when set.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn,meshdrop_node=info,meshdrop_core=info",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default TCP port for control and download links.
pub const DEFAULT_LISTEN_PORT: u16 = 45710;

/// Daemon configuration. File: ~/.config/meshdrop/config.toml or /etc/meshdrop/config.toml.
/// Env overrides: MESHDROP_LISTEN_PORT, MESHDROP_DOWNLOAD_DIR, MESHDROP_NAME.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// TCP listen port (default 45710).
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Where downloads land (default: current directory).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// Display name to announce instead of the assigned one.
    #[serde(default)]
    pub name: Option<String>,
    /// Protocol tunables passed to the core.
    #[serde(default)]
    pub mesh: meshdrop_core::Config,
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_download_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            download_dir: default_download_dir(),
            name: None,
            mesh: meshdrop_core::Config::default(),
        }
    }
}

/// Load config: merge default, then config file (explicit path, else the first present), then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let mut c = match explicit {
        Some(path) => parse_file(path)?,
        None => load_file().unwrap_or_default(),
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    Ok(c)
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("MESHDROP_LISTEN_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.listen_port = p,
            Err(_) => tracing::warn!(value = %s, "Ignoring invalid MESHDROP_LISTEN_PORT"),
        }
    }
    if let Some(s) = var("MESHDROP_DOWNLOAD_DIR") {
        if !s.is_empty() {
            c.download_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("MESHDROP_NAME") {
        if !s.trim().is_empty() {
            c.name = Some(s);
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/meshdrop/config.toml"));
    }
    out.push(PathBuf::from("/etc/meshdrop/config.toml"));
    out
}

fn parse_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)?;
    Ok(toml::from_str::<Config>(&s)?)
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match parse_file(&p) {
                Ok(c) => return Some(c),
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "Ignoring unreadable config file");
                }
            }
            break;
        }
    }
    None
}

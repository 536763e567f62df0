//! Configuration for the playerstore server
//!
//! Handles data directory configuration with the following precedence:
//! 1. PLAYERSTORE_DATA_DIR environment variable
//! 2. ~/.config/playerstore/data (production default)
//! 3. ./data (fallback for development)
//!
//! Store tuning (`PLAYERSTORE_RETRY_*`, `PLAYERSTORE_AUTOSAVE_SECS`, ...) is
//! read by [`StoreConfig`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use playerstore::StoreConfig;

const DEFAULT_CONFIG_DIR: &str = ".config/playerstore/data";
const DEV_DATA_DIR: &str = "./data";
const DEFAULT_LISTEN: &str = "127.0.0.1:7420";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sqlite,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "memory" => Ok(BackendKind::Memory),
            other => anyhow::bail!("unknown backend {:?}, expected sqlite or memory", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub data_dir: PathBuf,
    pub listen: SocketAddr,
    pub backend: BackendKind,
    /// Daily rolling log files are written here when set.
    pub log_dir: Option<PathBuf>,
    pub store: StoreConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen = lookup("PLAYERSTORE_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("PLAYERSTORE_LISTEN is not a socket address: {}", listen))?;
        let backend = match lookup("PLAYERSTORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => BackendKind::Sqlite,
        };

        Ok(Self {
            data_dir: data_dir_from(&lookup),
            listen,
            backend,
            log_dir: lookup("PLAYERSTORE_LOG_DIR").map(PathBuf::from),
            store: StoreConfig::from_lookup(&lookup)?,
        })
    }
}

/// Get the data directory for persistence.
///
/// Priority:
/// 1. PLAYERSTORE_DATA_DIR if set
/// 2. $HOME/.config/playerstore/data if HOME is set
/// 3. ./data as fallback
fn data_dir_from<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("PLAYERSTORE_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = lookup("HOME") {
        return PathBuf::from(home).join(DEFAULT_CONFIG_DIR);
    }

    PathBuf::from(DEV_DATA_DIR)
}

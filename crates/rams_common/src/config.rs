//! Daemon configuration.
//!
//! Loaded from /etc/rams/config.toml when running as a system service,
//! falling back to $XDG_CONFIG_HOME/rams/config.toml, then defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RamsConfig {
    /// Address the HTTP API binds to.
    pub listen_addr: String,

    /// SQLite database path.
    pub db_path: PathBuf,

    /// Directory for the JSONL audit log.
    pub audit_dir: PathBuf,
}

impl Default for RamsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7810".to_string(),
            db_path: PathBuf::from("/var/lib/rams/rams.db"),
            audit_dir: PathBuf::from("/var/lib/rams/audit"),
        }
    }
}

impl RamsConfig {
    pub fn load() -> Self {
        for path in Self::candidate_paths() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                match toml::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Ignoring malformed config {}: {}", path.display(), e)
                    }
                }
            }
        }
        Self::default()
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::user_config_path()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/rams/config.toml")];
        if let Some(user) = Self::user_config_path() {
            paths.push(user);
        }
        paths
    }

    fn user_config_path() -> Option<PathBuf> {
        let config_dir = if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            PathBuf::from(xdg)
        } else {
            let home = std::env::var("HOME").ok()?;
            PathBuf::from(home).join(".config")
        };

        Some(config_dir.join("rams").join("config.toml"))
    }
}

//! Persistent configuration (`~/.lam/config.json`)

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Runtime configuration
///
/// Keys are camelCase on disk. Keys missing from an existing file are filled with
/// defaults and the file is rewritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub http_port: u16,
    pub https_port: u16,
    pub storage_path: PathBuf,
    pub certs_path: PathBuf,
    pub hosts_file: PathBuf,
    pub enable_https: bool,
    pub auto_update_hosts: bool,
    pub enable_web_socket_proxy: bool,
}

impl Config {
    /// Defaults rooted at `base_dir` (normally `~/.lam`)
    pub fn with_base_dir(base_dir: &Path) -> Self {
        Self {
            http_port: 80,
            https_port: 443,
            storage_path: base_dir.join("mappings.json"),
            certs_path: base_dir.join("certs"),
            hosts_file: PathBuf::from("/etc/hosts"),
            enable_https: false,
            auto_update_hosts: false,
            enable_web_socket_proxy: true,
        }
    }

    /// `~/.lam`
    pub fn default_dir() -> io::Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Failed to get home directory")
        })?;
        Ok(home.join(".lam"))
    }

    pub fn default_path() -> io::Result<PathBuf> {
        Ok(Self::default_dir()?.join("config.json"))
    }

    /// Load the configuration file, creating or completing it as needed
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let defaults = Self::with_base_dir(base_dir);

        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("Creating default configuration at {}", path.display());
                defaults.save(path)?;
                return Ok(defaults);
            }
            Err(e) => return Err(e),
        };

        let mut value: serde_json::Value = serde_json::from_str(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let default_value = serde_json::to_value(&defaults)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut completed = false;
        if let (Some(current), Some(default_map)) = (value.as_object_mut(), default_value.as_object())
        {
            for (key, default) in default_map {
                if !current.contains_key(key) {
                    current.insert(key.clone(), default.clone());
                    completed = true;
                }
            }
        }

        let config: Config = serde_json::from_value(value)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if completed {
            if let Err(e) = config.save(path) {
                warn!("Could not update configuration {}: {}", path.display(), e);
            }
        }

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, json)
    }
}

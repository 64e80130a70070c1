//! Configuration Vault – reads/writes `~/.spatialvcs/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use svcs_runtime::EngineConfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to access config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Persisted settings stored in `~/.spatialvcs/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Vector file of the semantic index; the metadata sidecar sits next to
    /// it with a `.json` extension.
    #[serde(default = "default_index_path")]
    pub index_path: String,

    /// Capacity of each event bus topic.
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,

    #[serde(default)]
    pub engine: EngineConfig,
}

fn default_index_path() -> String {
    "data/memory/spatial_index.db".to_string()
}
fn default_bus_capacity() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            bus_capacity: default_bus_capacity(),
            engine: EngineConfig::default(),
        }
    }
}

/// Return the path to `~/.spatialvcs/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".spatialvcs").join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, ConfigError> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: Config = toml::from_str(&raw)?;
    apply_env_overrides(&mut cfg);
    cfg.engine
        .validate()
        .map_err(|e| ConfigError::Invalid(e.to_string()))?;
    Ok(Some(cfg))
}

/// Apply `SVCS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SVCS_DETECTION_STRIDE` | `engine.detection_stride` |
/// | `SVCS_DESCRIPTION_STRIDE` | `engine.description_stride` |
/// | `SVCS_LABEL_TTL_SECS` | `engine.label_ttl_secs` |
/// | `SVCS_BUCKET_PX` | `engine.bucket_px` |
/// | `SVCS_INDEX_PATH` | `index_path` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides_from(cfg, |key| std::env::var(key).ok());
}

pub(crate) fn apply_overrides_from(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SVCS_DETECTION_STRIDE")
        && let Ok(n) = v.trim().parse::<u64>()
    {
        cfg.engine.detection_stride = n;
    }
    if let Some(v) = lookup("SVCS_DESCRIPTION_STRIDE")
        && let Ok(n) = v.trim().parse::<u64>()
    {
        cfg.engine.description_stride = n;
    }
    if let Some(v) = lookup("SVCS_LABEL_TTL_SECS")
        && let Ok(secs) = v.trim().parse::<f64>()
    {
        cfg.engine.label_ttl_secs = secs;
    }
    if let Some(v) = lookup("SVCS_BUCKET_PX")
        && let Ok(px) = v.trim().parse::<f64>()
    {
        cfg.engine.bucket_px = px;
    }
    if let Some(v) = lookup("SVCS_INDEX_PATH")
        && !v.trim().is_empty()
    {
        cfg.index_path = v;
    }
}

/// Save the config to disk, creating `~/.spatialvcs/` if necessary.
pub fn save(cfg: &Config) -> Result<(), ConfigError> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
        // Owner-only directory (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700)).map_err(io_err)?;
        }
    }
    let raw = toml::to_string_pretty(cfg)?;
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(io_err)?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(io_err)?;
    Ok(())
}

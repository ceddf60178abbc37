//! Configuration resolution for the telemetry pipeline.
//!
//! The core treats configuration as an opaque, already-validated structure;
//! this module only locates `.tattle.json`, parses it, and resolves the
//! store directory against the project root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::redact::RedactionRules;

/// Config file name searched for from the working directory upwards.
pub const CONFIG_FILE: &str = ".tattle.json";

/// Environment variable pointing at an explicit config file or directory.
pub const CONFIG_ENV: &str = "TATTLE_CONFIG";

/// Errors locating or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Validated pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TattleConfig {
    /// Master switch; when false every write path is a silent no-op.
    pub enabled: bool,
    /// `service` stamped on events whose producer did not name one.
    pub default_service: String,
    /// Store directory, resolved against the root dir unless absolute.
    pub store_dir: String,
    /// Additions to the built-in redaction rules.
    pub redaction: RedactionRules,
}

impl Default for TattleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_service: "app".to_owned(),
            store_dir: "logs/tattle".to_owned(),
            redaction: RedactionRules::default(),
        }
    }
}

/// A loaded configuration plus where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: TattleConfig,
    /// Directory every relative path resolves against.
    pub root_dir: PathBuf,
    /// The file the config was read from, if one was found.
    pub config_path: Option<PathBuf>,
}

/// Load configuration for the project containing `cwd`.
///
/// `TATTLE_CONFIG` names an explicit file (or a directory containing
/// `.tattle.json`) and must exist when set. Otherwise the file is searched
/// for from `cwd` upwards; when none exists, defaults apply with the
/// repository root (nearest `.git` ancestor, falling back to `cwd`) as the
/// root dir.
pub fn load_config(cwd: &Path) -> Result<LoadedConfig, ConfigError> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV) {
        let mut path = cwd.join(explicit);
        if path.is_dir() {
            path = path.join(CONFIG_FILE);
        }
        if !path.is_file() {
            return Err(ConfigError::NotFound(path));
        }
        return load_file(&path);
    }

    let mut current = cwd.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.is_file() {
            return load_file(&candidate);
        }
        if !current.pop() {
            break;
        }
    }

    Ok(LoadedConfig {
        config: TattleConfig::default(),
        root_dir: find_repo_root(cwd),
        config_path: None,
    })
}

fn load_file(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: TattleConfig =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    let root_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Ok(LoadedConfig {
        config,
        root_dir,
        config_path: Some(path.to_path_buf()),
    })
}

/// Walk upwards from `start` looking for a `.git` marker; `start` when none.
pub fn find_repo_root(start: &Path) -> PathBuf {
    let mut current = start.to_path_buf();
    loop {
        if current.join(".git").exists() {
            return current;
        }
        if !current.pop() {
            return start.to_path_buf();
        }
    }
}

/// Resolve the store directory: absolute paths pass through, relative paths
/// resolve against the root dir.
pub fn resolve_store_dir(config: &TattleConfig, root_dir: &Path) -> PathBuf {
    let store = Path::new(&config.store_dir);
    if store.is_absolute() {
        store.to_path_buf()
    } else {
        root_dir.join(store)
    }
}

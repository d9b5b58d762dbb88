//! Configuration loaded from TOML.
//!
//! Lookup order: `./kscope.toml`, then `~/.kscope/config.toml`. A missing
//! file is not an error; defaults apply.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_tracing_level_filter(self) -> tracing::level_filters::LevelFilter {
        use tracing::level_filters::LevelFilter;
        match self {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Override the discovered tracefs mount point.
    pub tracefs_root: Option<PathBuf>,

    /// Prefix for the per-process probe group name.
    pub group_prefix: String,

    pub log_file: Option<PathBuf>,

    pub log_level: LogLevel,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            tracefs_root: None,
            group_prefix: "kscope".to_string(),
            log_file: None,
            log_level: LogLevel::default(),
        }
    }
}

impl Settings {
    /// Load from the first config file found, defaults otherwise.
    pub fn load() -> Result<Self> {
        for path in Self::candidate_paths() {
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        debug!("no config file found, using defaults");
        Ok(Settings::default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let settings =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(settings)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("kscope.toml")];
        if let Some(home) = std::env::var_os("HOME") {
            paths.push(PathBuf::from(home).join(".kscope").join("config.toml"));
        }
        paths
    }
}

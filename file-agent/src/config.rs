//! Configuration management for the file agent.
//!
//! Loads configuration from a TOML file with `FILE_AGENT__SECTION__KEY`
//! environment variable overrides. Every field has a default, so an empty
//! file (or no file at all) yields a usable agent.
//!
//! The file is read with `toml` so table keys (project ids) keep their
//! case; the `config` crate only supplies the environment layer.

use crate::utils::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Prefix for environment overrides, e.g. `FILE_AGENT__AGENT__PORT=9000`.
const ENV_PREFIX: &str = "FILE_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agent: AgentConfig,
    pub files: FilesConfig,
    pub backup: BackupConfig,
    pub log: LogConfig,
    /// Managed projects keyed by project id
    pub projects: HashMap<String, ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unique agent identifier
    pub id: String,

    /// HTTP/WebSocket server port
    pub port: u16,

    /// Working directory for chunk sessions, downloads and backups
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Suffixes that may be read/written as text (`conf`, `.yml`, `*` for all)
    pub allowed_edit_suffixes: Vec<String>,

    /// Checksum mismatches tolerated per chunk session before it is discarded
    pub max_merge_attempts: u32,

    /// Chunk sessions untouched for this long are reaped
    pub session_ttl_secs: u64,

    /// How often the session sweeper runs
    pub sweep_interval_secs: u64,

    /// Default timeout for remote downloads
    pub download_timeout_secs: u64,

    /// Largest accepted request body (single upload or chunk)
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Copy the project library before each mutation (rollback support)
    pub copy_files: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Colored output
    pub ansi: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Project library directory
    pub path: PathBuf,

    /// PID file written by the managed process
    pub pid_file: Option<PathBuf>,

    /// Shell command whose exit status tells whether the process runs
    pub status_command: Option<String>,

    pub stop_command: Option<String>,

    pub restart_command: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "file-agent-01".to_string()),
            port: 2123,
            data_dir: PathBuf::from("/var/lib/file-agent"),
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            allowed_edit_suffixes: ["txt", "conf", "properties", "yml", "yaml", "json", "xml", "sh", "ini", "env"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_merge_attempts: 5,
            session_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 10 * 60,
            download_timeout_secs: 300,
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { copy_files: true }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut merged = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| AgentError::Config(format!("{}: {}", path.display(), e)))?;
                let table: toml::Table =
                    toml::from_str(&content).map_err(|e| AgentError::Config(e.to_string()))?;
                serde_json::to_value(table).map_err(|e| AgentError::Config(e.to_string()))?
            }
            None => serde_json::Value::Object(Default::default()),
        };

        let overrides = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<serde_json::Value>())
            .map_err(|e| AgentError::Config(e.to_string()))?;
        merge_values(&mut merged, overrides);

        serde_json::from_value(merged).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Parse configuration from TOML text (no environment overrides).
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config(e.to_string()))
    }

    /// Directory holding chunk sessions.
    pub fn slices_dir(&self) -> PathBuf {
        self.agent.data_dir.join("slices")
    }

    /// Directory for transient downloads and merged files.
    pub fn temp_dir(&self) -> PathBuf {
        self.agent.data_dir.join("tmp")
    }

    /// Root of the append-only backup store.
    pub fn backups_dir(&self) -> PathBuf {
        self.agent.data_dir.join("backups")
    }

    pub fn project(&self, id: &str) -> Result<&ProjectConfig> {
        self.projects
            .get(id)
            .ok_or_else(|| AgentError::NotFound(format!("project {}", id)))
    }
}

/// Overlay `overrides` onto `base`, recursing into tables.
fn merge_values(base: &mut serde_json::Value, overrides: serde_json::Value) {
    match (base, overrides) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overrides)) => {
            for (key, value) in overrides {
                merge_values(base.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (base, value) => *base = value,
    }
}

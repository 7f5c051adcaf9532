//! dagboard configuration.
//!
//! Resolved through a chain, first hit wins:
//!
//! 1. `--config <path>`: explicit file, must exist
//! 2. `<root>/.dagboard/config.toml`: per-project settings
//! 3. `<config dir>/dagboard/config.toml`: per-user defaults
//! 4. built-in defaults
//!
//! Every field has a default, so a file only needs the keys it changes.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::storage::{DEFAULT_RETENTION, Storage};

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// dagboard configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub runner: RunnerConfig,
    pub graph: GraphConfig,
    pub stream: StreamConfig,
    pub discover: DiscoverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5050,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Relative paths resolve against the project root.
    pub path: Option<PathBuf>,

    /// How many jobs to keep before pruning the oldest.
    pub retention: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            retention: DEFAULT_RETENTION,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunnerConfig {
    /// Engine command; the requested outputs are appended as arguments.
    pub command: Vec<String>,

    /// Finished jobs kept in memory for `/api/job/{id}`.
    pub registry_capacity: usize,

    /// Most recent output lines kept in memory per job.
    pub registry_lines: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".into(), "scripts/dss/execute.py".into()],
            registry_capacity: 100,
            registry_lines: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct GraphConfig {
    pub command: Vec<String>,
    pub title: String,
    pub project: String,
    pub environment: String,
    pub timeout_secs: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".into(), "scripts/dss/introspect.py".into()],
            title: "PZL-DSS Pipeline".into(),
            project: "pzl-dss-template".into(),
            environment: "production".into(),
            timeout_secs: 60,
        }
    }
}

impl GraphConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StreamConfig {
    pub poll_interval_ms: u64,
    pub heartbeat_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            heartbeat_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiscoverConfig {
    /// Directories searched for cached tables, relative to the root.
    pub cache_dirs: Vec<PathBuf>,

    /// Where visualizations live, relative to the root.
    pub results_dir: PathBuf,

    /// Most image paths returned for one node.
    pub max_images: usize,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            cache_dirs: vec![
                PathBuf::from("results/cache"),
                PathBuf::from("data/processed"),
                PathBuf::from("data"),
            ],
            results_dir: PathBuf::from("results"),
            max_images: 12,
        }
    }
}

impl Config {
    /// Resolve and load the configuration for a project root.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        // 1. Explicit --config path.
        if let Some(path) = explicit {
            return match read(path)? {
                Some(config) => Ok(config),
                None => Err(ConfigError::NotFound(path.to_path_buf())),
            };
        }

        // 2. Project config, 3. user config.
        for path in [Some(Self::project_path(root)), Self::user_path()]
            .into_iter()
            .flatten()
        {
            if let Some(config) = read(&path)? {
                return Ok(config);
            }
        }

        // 4. Defaults.
        Ok(Self::default())
    }

    /// The project config path: `<root>/.dagboard/config.toml`.
    pub fn project_path(root: &Path) -> PathBuf {
        root.join(".dagboard").join("config.toml")
    }

    /// The user config path: `<config dir>/dagboard/config.toml`.
    pub fn user_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("dagboard").join("config.toml"))
    }

    /// Where the job store lives for this project.
    pub fn store_path(&self, root: &Path) -> PathBuf {
        match &self.store.path {
            Some(path) => root.join(path),
            None => Storage::default_path(root),
        }
    }

    /// Parse a config from TOML text and validate it.
    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.runner.command.is_empty() {
            return Err(ConfigError::Invalid("runner.command is empty".into()));
        }
        if self.graph.command.is_empty() {
            return Err(ConfigError::Invalid("graph.command is empty".into()));
        }
        if self.stream.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "stream.poll-interval-ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Read a config file, or `None` if it doesn't exist.
fn read(path: &Path) -> Result<Option<Config>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    Config::from_toml(&contents, path).map(Some)
}

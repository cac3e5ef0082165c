//! Engine configuration.
//!
//! A TOML file at `~/.config/cairn/config.toml` plus a resolution chain:
//! explicit value > env var > config file > default.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const ENV_MAX_PARALLEL_TASKS: &str = "CAIRN_MAX_PARALLEL_TASKS";
pub const ENV_SNAPSHOT_PATH: &str = "CAIRN_SNAPSHOT_PATH";
pub const ENV_LOG: &str = "CAIRN_LOG";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parallel_tasks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `"info,cairn_core=debug"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// `$XDG_CONFIG_HOME/cairn` or `~/.config/cairn`, on every platform.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("cairn");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("cairn")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Parse a config file. A missing file is an error; callers that treat it
/// as optional check for existence first.
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

pub fn save_config_file(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }
    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_parallel_tasks must be at least 1")]
    NoParallelism,
    #[error("{var} is not a valid number: {value:?}")]
    BadNumber { var: &'static str, value: String },
}

/// Values given explicitly by the embedding program. They win over
/// everything else.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub max_parallel_tasks: Option<usize>,
    pub snapshot_path: Option<PathBuf>,
    pub log_filter: Option<String>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Upper bound on tasks of one phase running at the same time.
    pub max_parallel_tasks: usize,
    /// Where the model is persisted. `None` keeps it in memory only.
    pub snapshot_path: Option<PathBuf>,
    pub log_filter: String,
}

impl EngineConfig {
    pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 8;
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    /// In-memory engine with default settings.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn with_max_parallel_tasks(mut self, n: usize) -> Self {
        self.max_parallel_tasks = n;
        self
    }

    /// Resolve against the process environment and the config file at
    /// [`config_path`] (if present).
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self> {
        let path = config_path();
        let file = if path.exists() {
            Some(load_config_file(&path)?)
        } else {
            None
        };
        let config = Self::resolve_with(overrides, file.as_ref(), |var| std::env::var(var).ok())?;
        tracing::debug!(?config, "engine config resolved");
        Ok(config)
    }

    /// Resolution chain with an injectable environment.
    pub fn resolve_with(
        overrides: &ConfigOverrides,
        file: Option<&ConfigFile>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let max_parallel_tasks = match overrides.max_parallel_tasks {
            Some(n) => n,
            None => match env(ENV_MAX_PARALLEL_TASKS) {
                Some(raw) => raw.trim().parse().map_err(|_| ConfigError::BadNumber {
                    var: ENV_MAX_PARALLEL_TASKS,
                    value: raw.clone(),
                })?,
                None => file
                    .and_then(|f| f.engine.max_parallel_tasks)
                    .unwrap_or(Self::DEFAULT_MAX_PARALLEL_TASKS),
            },
        };

        let snapshot_path = overrides
            .snapshot_path
            .clone()
            .or_else(|| env(ENV_SNAPSHOT_PATH).map(PathBuf::from))
            .or_else(|| file.and_then(|f| f.engine.snapshot_path.clone()));

        let log_filter = overrides
            .log_filter
            .clone()
            .or_else(|| env(ENV_LOG))
            .or_else(|| file.and_then(|f| f.logging.filter.clone()))
            .unwrap_or_else(|| Self::DEFAULT_LOG_FILTER.to_owned());

        let config = Self {
            max_parallel_tasks,
            snapshot_path,
            log_filter,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_tasks == 0 {
            return Err(ConfigError::NoParallelism);
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: Self::DEFAULT_MAX_PARALLEL_TASKS,
            snapshot_path: None,
            log_filter: Self::DEFAULT_LOG_FILTER.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |var| map.get(var).cloned()
    }

    fn file() -> ConfigFile {
        ConfigFile {
            engine: EngineSection {
                max_parallel_tasks: Some(3),
                snapshot_path: Some(PathBuf::from("/var/lib/cairn/model.json")),
            },
            logging: LoggingSection {
                filter: Some("debug".to_owned()),
            },
        }
    }

    #[test]
    fn defaults_without_any_source() {
        let config =
            EngineConfig::resolve_with(&ConfigOverrides::default(), None, env_of(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.log_filter, "info");
        assert!(config.snapshot_path.is_none());
    }

    #[test]
    fn file_beats_default() {
        let config =
            EngineConfig::resolve_with(&ConfigOverrides::default(), Some(&file()), env_of(&[]))
                .unwrap();
        assert_eq!(config.max_parallel_tasks, 3);
        assert_eq!(config.log_filter, "debug");
        assert_eq!(
            config.snapshot_path.as_deref(),
            Some(Path::new("/var/lib/cairn/model.json"))
        );
    }

    #[test]
    fn env_beats_file() {
        let env = env_of(&[
            (ENV_MAX_PARALLEL_TASKS, "5"),
            (ENV_SNAPSHOT_PATH, "/tmp/model.json"),
            (ENV_LOG, "warn"),
        ]);
        let config =
            EngineConfig::resolve_with(&ConfigOverrides::default(), Some(&file()), env).unwrap();
        assert_eq!(config.max_parallel_tasks, 5);
        assert_eq!(config.snapshot_path.as_deref(), Some(Path::new("/tmp/model.json")));
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn explicit_beats_env() {
        let overrides = ConfigOverrides {
            max_parallel_tasks: Some(1),
            snapshot_path: Some(PathBuf::from("/srv/model.json")),
            log_filter: Some("trace".to_owned()),
        };
        let env = env_of(&[(ENV_MAX_PARALLEL_TASKS, "5"), (ENV_LOG, "warn")]);
        let config = EngineConfig::resolve_with(&overrides, Some(&file()), env).unwrap();
        assert_eq!(config.max_parallel_tasks, 1);
        assert_eq!(config.snapshot_path.as_deref(), Some(Path::new("/srv/model.json")));
        assert_eq!(config.log_filter, "trace");
    }

    #[test]
    fn rejects_zero_and_garbage() {
        let env = env_of(&[(ENV_MAX_PARALLEL_TASKS, "0")]);
        let err = EngineConfig::resolve_with(&ConfigOverrides::default(), None, env).unwrap_err();
        assert_eq!(err, ConfigError::NoParallelism);

        let env = env_of(&[(ENV_MAX_PARALLEL_TASKS, "many")]);
        let err = EngineConfig::resolve_with(&ConfigOverrides::default(), None, env).unwrap_err();
        assert!(matches!(err, ConfigError::BadNumber { .. }));
        assert!(err.to_string().contains("many"));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("cairn").join("config.toml");
        save_config_file(&path, &file()).unwrap();
        let loaded = load_config_file(&path).unwrap();
        assert_eq!(loaded, file());
    }

    #[test]
    fn partial_file_parses() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[engine]\nmax_parallel_tasks = 2\n").unwrap();
        let loaded = load_config_file(&path).unwrap();
        assert_eq!(loaded.engine.max_parallel_tasks, Some(2));
        assert!(loaded.logging.filter.is_none());
    }

    #[test]
    fn missing_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = load_config_file(&tmp.path().join("nope.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn config_path_ends_with_cairn_config() {
        assert!(config_path().ends_with("cairn/config.toml"));
    }
}

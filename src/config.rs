//! Driver configuration.
//!
//! Loaded from `sqlshim.toml`:
//!
//! ```toml
//! idle_timeout_ms = 10000
//!
//! [log]
//! raw_sql = true
//!
//! [targets.app]
//! database = "/var/lib/app/app.db"
//! presql = "pragma busy_timeout = 5000;"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ShimError, ShimResult};
use crate::pool::MEMORY_TARGET;

pub const CONFIG_FILE: &str = "sqlshim.toml";

/// Which execution events are logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub raw_sql: bool,
    pub notices: bool,
    pub warnings: bool,
    pub error_sql_state: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            raw_sql: false,
            notices: true,
            warnings: true,
            error_sql_state: false,
        }
    }
}

/// A named database target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbTarget {
    /// File path, or `:memory:`.
    pub database: String,
    /// SQL run before each non-transactional execution.
    #[serde(default)]
    pub presql: Option<String>,
}

impl DbTarget {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            presql: None,
        }
    }

    pub fn memory() -> Self {
        Self::new(MEMORY_TARGET)
    }

    pub fn presql(mut self, sql: impl Into<String>) -> Self {
        self.presql = Some(sql.into());
        self
    }
}

/// Top-level driver configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    pub idle_timeout_ms: u64,
    pub log: LogConfig,
    pub targets: HashMap<String, DbTarget>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 10_000,
            log: LogConfig::default(),
            targets: HashMap::new(),
        }
    }
}

impl DriverConfig {
    pub fn builder() -> DriverConfigBuilder {
        DriverConfigBuilder::default()
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Look up a named target.
    pub fn target(&self, name: &str) -> ShimResult<&DbTarget> {
        self.targets
            .get(name)
            .ok_or_else(|| ShimError::Config(format!("unknown target: {name}")))
    }

    pub fn from_toml(content: &str) -> ShimResult<Self> {
        toml::from_str(content).map_err(|e| ShimError::Config(e.to_string()))
    }

    /// Load from `path`, else `./sqlshim.toml`, else the user config
    /// directory, else defaults.
    pub fn load(path: Option<&Path>) -> ShimResult<Self> {
        if let Some(path) = path {
            return Self::read(path);
        }
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Self::read(&candidate);
            }
        }
        Ok(Self::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("sqlshim").join(CONFIG_FILE));
        }
        paths
    }

    fn read(path: &Path) -> ShimResult<Self> {
        debug!(target: "sqlshim::config", "loading {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}

/// Builder for DriverConfig
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn log(mut self, log: LogConfig) -> Self {
        self.config.log = log;
        self
    }

    /// Register a named target.
    pub fn target(mut self, name: impl Into<String>, target: DbTarget) -> Self {
        self.config.targets.insert(name.into(), target);
        self
    }

    pub fn build(self) -> DriverConfig {
        self.config
    }
}

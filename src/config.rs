use std::path::Path;

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use crate::errors::Result;
use crate::models::{EventDefinition, MetricDefinition};

/// Top-level config, loadable from a `cattledb.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct CattleConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default = "default_true")]
    pub admin: bool,
    /// Metric definitions seeded before `database_init`.
    #[serde(default)]
    pub metrics: Vec<MetricDefinition>,
    /// Event definitions seeded before `database_init`.
    #[serde(default)]
    pub events: Vec<EventDefinition>,
}

impl Default for CattleConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            table_prefix: default_table_prefix(),
            read_only: false,
            admin: true,
            metrics: Vec::new(),
            events: Vec::new(),
        }
    }
}

fn default_table_prefix() -> String {
    "cdb".to_string()
}

fn default_true() -> bool {
    true
}

/// Storage backend selection and options.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    WideColumn(WideColumnOptions),
    Sqlite(SqliteOptions),
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Sqlite(SqliteOptions {
            data_dir: ".".to_string(),
            in_memory: false,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WideColumnOptions {
    #[serde(default = "default_wide_url")]
    pub url: String,
    #[serde(default = "default_wide_database")]
    pub database: String,
    #[serde(default = "default_wide_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_wide_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_wide_database() -> String {
    "cattledb".to_string()
}

fn default_wide_user() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqliteOptions {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub in_memory: bool,
}

fn default_data_dir() -> String {
    ".".to_string()
}

impl CattleConfig {
    /// Load config from a TOML file. Returns defaults if the file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("config file not found at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)?;
        let config: CattleConfig = toml::from_str(&contents)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Convenience config backed by a throwaway in-memory database.
    pub fn sqlite_in_memory() -> Self {
        Self {
            engine: EngineConfig::Sqlite(SqliteOptions {
                data_dir: ".".to_string(),
                in_memory: true,
            }),
            ..Self::default()
        }
    }
}

/// Install a global tracing subscriber honouring `RUST_LOG`.
pub fn setup_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cattledb=debug")),
        )
        .try_init();
}

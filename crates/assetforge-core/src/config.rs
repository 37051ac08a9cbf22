//! Configuration schema (assetforge.toml)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE_NAME: &str = "assetforge.toml";

/// dbt project settings used by the asset adapter and the dbt CLI client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbtConfig {
    /// dbt executable (resolved through PATH when not absolute)
    #[serde(default = "default_executable")]
    pub executable: String,

    /// Arguments placed before dbt's own (e.g. `["run", "dbt"]` for `uv`)
    #[serde(default)]
    pub executable_args: Vec<String>,

    /// `--project-dir` passed to every dbt invocation
    #[serde(default)]
    pub project_dir: Option<PathBuf>,

    /// `--profiles-dir` passed to every dbt invocation
    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,

    /// `--target` passed to every dbt invocation
    #[serde(default)]
    pub target: Option<String>,

    /// Path to manifest.json, relative to the project root
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Default include selection
    #[serde(default = "default_select")]
    pub select: String,

    /// Default exclude selection
    #[serde(default)]
    pub exclude: Option<String>,
}

fn default_executable() -> String {
    "dbt".to_string()
}

fn default_manifest() -> PathBuf {
    PathBuf::from("target/manifest.json")
}

fn default_select() -> String {
    "*".to_string()
}

impl Default for DbtConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            executable_args: Vec::new(),
            project_dir: None,
            profiles_dir: None,
            target: None,
            manifest: default_manifest(),
            select: default_select(),
            exclude: None,
        }
    }
}

impl DbtConfig {
    /// Manifest path resolved against the project root
    pub fn manifest_path(&self, project_root: &Path) -> PathBuf {
        if self.manifest.is_absolute() {
            self.manifest.clone()
        } else if let Some(project_dir) = &self.project_dir {
            project_root.join(project_dir).join(&self.manifest)
        } else {
            project_root.join(&self.manifest)
        }
    }
}

/// Warehouse connection configuration
///
/// Settings are kept as raw TOML values; the warehouse crate validates them
/// into a typed resource config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseConfig {
    /// Warehouse type (only snowflake today)
    #[serde(rename = "type", default = "default_warehouse_type")]
    pub warehouse_type: String,

    /// Connection settings (warehouse-specific)
    #[serde(flatten)]
    pub settings: BTreeMap<String, toml::Value>,
}

fn default_warehouse_type() -> String {
    "snowflake".to_string()
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            warehouse_type: default_warehouse_type(),
            settings: BTreeMap::new(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// dbt project settings
    #[serde(default)]
    pub dbt: DbtConfig,

    /// Warehouse connection configuration
    #[serde(default)]
    pub warehouse: Option<WarehouseConfig>,

    /// Project root path (for resolving relative paths)
    #[serde(skip)]
    pub project_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dbt: DbtConfig::default(),
            warehouse: None,
            project_root: std::env::current_dir().unwrap_or_default(),
        }
    }
}

impl Config {
    /// Load config from TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.display().to_string(), e.to_string()))?;

        let mut config = Self::from_toml(&contents)?;

        // Set project root to parent of config file
        if let Some(parent) = path.parent() {
            config.project_root = parent.to_path_buf();
        }

        Ok(config)
    }

    /// Load config from TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(toml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.project_root = std::env::current_dir().unwrap_or_default();
        Ok(config)
    }

    /// Load an explicit config file, or `assetforge.toml` from the working
    /// directory if it exists, or fall back to defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_path = Path::new(CONFIG_FILE_NAME);
        if default_path.exists() {
            Self::from_file(default_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to TOML file
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let toml = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, toml)
            .map_err(|e| ConfigError::IoError(path.display().to_string(), e.to_string()))?;

        Ok(())
    }
}

/// Config error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),
}

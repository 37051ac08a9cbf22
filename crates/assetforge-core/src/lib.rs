//! assetforge core
//!
//! Workspace configuration (`assetforge.toml`) and environment resolution
//! shared by the dbt, warehouse and instance crates.

pub mod config;
pub mod env;

pub use config::{Config, ConfigError, DbtConfig, WarehouseConfig, CONFIG_FILE_NAME};
pub use env::{load_dotenv, resolve_env_refs, resolve_value, EnvError, ENV_PREFIX};

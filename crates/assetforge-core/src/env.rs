//! Environment lookups for config values
//!
//! String settings of the form `env:NAME` are replaced with the value of the
//! environment variable `NAME`, so secrets stay out of `assetforge.toml`.

use std::collections::BTreeMap;

/// Prefix marking a config value as an environment reference
pub const ENV_PREFIX: &str = "env:";

/// Load a `.env` file from the working directory (or its parents) if one exists.
///
/// Returns the path that was loaded. A missing file is not an error.
pub fn load_dotenv() -> Option<std::path::PathBuf> {
    dotenvy::dotenv().ok()
}

/// Resolve a single raw value, following an `env:` reference if present
pub fn resolve_value(raw: &str) -> Result<String, EnvError> {
    match raw.strip_prefix(ENV_PREFIX) {
        Some(name) => {
            let name = name.trim();
            if name.is_empty() {
                return Err(EnvError::EmptyReference(raw.to_string()));
            }
            std::env::var(name).map_err(|_| EnvError::MissingVariable(name.to_string()))
        }
        None => Ok(raw.to_string()),
    }
}

/// Resolve every `env:` string in a settings table
pub fn resolve_env_refs(
    settings: &BTreeMap<String, toml::Value>,
) -> Result<BTreeMap<String, toml::Value>, EnvError> {
    settings
        .iter()
        .map(|(key, value)| {
            let resolved = match value {
                toml::Value::String(raw) => toml::Value::String(resolve_value(raw)?),
                other => other.clone(),
            };
            Ok((key.clone(), resolved))
        })
        .collect()
}

/// Environment resolution errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnvError {
    #[error("Environment variable {0} is not set")]
    MissingVariable(String),

    #[error("Empty environment reference: '{0}'")]
    EmptyReference(String),
}

//! Instance settings (`$DAGSTER_HOME/instance.toml`)

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::instance::InstanceError;

/// Settings file name inside the instance home
pub const SETTINGS_FILE_NAME: &str = "instance.toml";

/// Instance-wide settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InstanceSettings {
    #[serde(default)]
    pub telemetry: TelemetrySettings,

    #[serde(default)]
    pub run_monitoring: RunMonitoringSettings,

    #[serde(default)]
    pub concurrency: ConcurrencySettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMonitoringSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Seconds between checks of in-flight runs
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for RunMonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    /// Slots allocated to a key the first time a run claims it, if the key
    /// has no explicit limit
    #[serde(default)]
    pub default_op_concurrency_limit: Option<usize>,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    120
}

impl InstanceSettings {
    /// Load settings from a file; a missing file means defaults
    pub fn load(path: &Path) -> Result<Self, InstanceError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| InstanceError::IoError(path.display().to_string(), e.to_string()))?;

        toml::from_str(&contents)
            .map_err(|e| InstanceError::ParseError(path.display().to_string(), e.to_string()))
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, InstanceError> {
        toml::to_string_pretty(self).map_err(|e| InstanceError::SerializeError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = InstanceSettings::load(&dir.path().join(SETTINGS_FILE_NAME)).unwrap();
        assert_eq!(settings, InstanceSettings::default());
        assert!(settings.telemetry.enabled);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(
            &path,
            "[run_monitoring]\nenabled = true\n\n[concurrency]\ndefault_op_concurrency_limit = 2\n",
        )
        .unwrap();

        let settings = InstanceSettings::load(&path).unwrap();
        assert!(settings.run_monitoring.enabled);
        assert_eq!(settings.run_monitoring.poll_interval_seconds, 120);
        assert_eq!(settings.concurrency.default_op_concurrency_limit, Some(2));
    }

    #[test]
    fn invalid_file_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, "[telemetry\n").unwrap();

        match InstanceSettings::load(&path) {
            Err(InstanceError::ParseError(file, _)) => assert!(file.ends_with(SETTINGS_FILE_NAME)),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}

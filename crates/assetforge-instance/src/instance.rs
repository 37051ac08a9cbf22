//! Instance handle
//!
//! An [`Instance`] is either persistent, rooted at `$DAGSTER_HOME`, or
//! ephemeral, living in memory with a scratch directory removed on drop. The
//! handle is created once per command and passed explicitly to whatever
//! needs it. Dropping a persistent handle flushes pending state to disk.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::concurrency::{ConcurrencySlot, ConcurrencyTable};
use crate::migrations::{self, CURRENT_SCHEMA_VERSION};
use crate::runs::{RunRecord, RunStatus, RunStorage};
use crate::settings::{InstanceSettings, SETTINGS_FILE_NAME};

/// Environment variable naming the instance home directory
pub const DAGSTER_HOME_ENV: &str = "DAGSTER_HOME";

const STORAGE_DIR: &str = "storage";
const STATE_FILE_NAME: &str = "instance.json";

/// Everything the instance stores
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageState {
    pub schema_version: u32,

    #[serde(flatten)]
    pub run_storage: RunStorage,

    #[serde(default)]
    pub concurrency: ConcurrencyTable,
}

impl Default for StorageState {
    fn default() -> Self {
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_storage: RunStorage::default(),
            concurrency: ConcurrencyTable::default(),
        }
    }
}

/// Instance errors
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("$DAGSTER_HOME \"{0}\" must be an absolute path. $DAGSTER_HOME must be set to an existing directory in your filesystem.")]
    HomeNotAbsolute(String),

    #[error("$DAGSTER_HOME \"{0}\" is not a directory or does not exist. $DAGSTER_HOME must be set to an existing directory in your filesystem.")]
    HomeNotDirectory(String),

    #[error("Failed to access {0}: {1}")]
    IoError(String, String),

    #[error("Failed to parse {0}: {1}")]
    ParseError(String, String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Instance storage schema version {stored} is newer than this build supports (latest {current})")]
    SchemaTooNew { stored: u32, current: u32 },

    #[error("Instance storage is out of date (schema version {stored}, latest {current}). Run `assetforge instance migrate` to update it.")]
    SchemaOutOfDate { stored: u32, current: u32 },

    #[error("Migration {version} ({name}) failed: {reason}")]
    MigrationFailed {
        version: u32,
        name: &'static str,
        reason: String,
    },

    #[error("Run {0} not found")]
    RunNotFound(String),

    #[error("Instance state lock poisoned")]
    LockPoisoned,
}

/// Mutable part of the instance
#[derive(Debug)]
struct Inner {
    state: StorageState,
    /// Stored document still waiting for `upgrade`
    outdated: Option<Value>,
    stored_version: u32,
    dirty: bool,
}

impl Inner {
    fn check_current(&self) -> Result<(), InstanceError> {
        match self.outdated {
            Some(_) => Err(InstanceError::SchemaOutOfDate {
                stored: self.stored_version,
                current: CURRENT_SCHEMA_VERSION,
            }),
            None => Ok(()),
        }
    }
}

/// Orchestration instance handle
#[derive(Debug)]
pub struct Instance {
    home: Option<PathBuf>,
    settings: InstanceSettings,
    storage_dir: PathBuf,
    inner: RwLock<Inner>,
    /// Scratch directory of an ephemeral instance, removed on drop
    _scratch: Option<tempfile::TempDir>,
}

impl Instance {
    /// Resolve the instance from `$DAGSTER_HOME`; unset or empty means ephemeral
    pub fn from_env() -> Result<Self, InstanceError> {
        let home = std::env::var_os(DAGSTER_HOME_ENV)
            .filter(|home| !home.is_empty())
            .map(PathBuf::from);
        Self::from_home(home)
    }

    /// Persistent instance for `Some(home)`, ephemeral for `None`
    pub fn from_home(home: Option<PathBuf>) -> Result<Self, InstanceError> {
        match home {
            Some(home) => Self::open(&home),
            None => Self::ephemeral(),
        }
    }

    /// In-memory instance with a temporary scratch directory
    pub fn ephemeral() -> Result<Self, InstanceError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| InstanceError::IoError("temporary directory".to_string(), e.to_string()))?;

        tracing::debug!(scratch = %scratch.path().display(), "Created ephemeral instance");

        Ok(Self {
            home: None,
            settings: InstanceSettings::default(),
            storage_dir: scratch.path().to_path_buf(),
            inner: RwLock::new(Inner {
                state: StorageState::default(),
                outdated: None,
                stored_version: CURRENT_SCHEMA_VERSION,
                dirty: false,
            }),
            _scratch: Some(scratch),
        })
    }

    /// Persistent instance rooted at `home`
    pub fn open(home: &Path) -> Result<Self, InstanceError> {
        if !home.is_absolute() {
            return Err(InstanceError::HomeNotAbsolute(home.display().to_string()));
        }
        if !home.is_dir() {
            return Err(InstanceError::HomeNotDirectory(home.display().to_string()));
        }

        let settings = InstanceSettings::load(&home.join(SETTINGS_FILE_NAME))?;
        let storage_dir = home.join(STORAGE_DIR);
        let state_path = storage_dir.join(STATE_FILE_NAME);

        let inner = if state_path.exists() {
            let contents = std::fs::read_to_string(&state_path).map_err(|e| {
                InstanceError::IoError(state_path.display().to_string(), e.to_string())
            })?;
            let doc: Value = serde_json::from_str(&contents).map_err(|e| {
                InstanceError::ParseError(state_path.display().to_string(), e.to_string())
            })?;
            Self::load_document(doc, &state_path)?
        } else {
            Inner {
                state: StorageState::default(),
                outdated: None,
                stored_version: CURRENT_SCHEMA_VERSION,
                dirty: true,
            }
        };

        tracing::debug!(
            home = %home.display(),
            schema_version = inner.stored_version,
            "Opened instance"
        );

        Ok(Self {
            home: Some(home.to_path_buf()),
            settings,
            storage_dir,
            inner: RwLock::new(inner),
            _scratch: None,
        })
    }

    fn load_document(doc: Value, path: &Path) -> Result<Inner, InstanceError> {
        let stored_version = migrations::stored_version(&doc);

        if stored_version > CURRENT_SCHEMA_VERSION {
            return Err(InstanceError::SchemaTooNew {
                stored: stored_version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }

        if stored_version < CURRENT_SCHEMA_VERSION {
            tracing::warn!(
                stored = stored_version,
                current = CURRENT_SCHEMA_VERSION,
                "Instance storage needs migration"
            );
            return Ok(Inner {
                state: StorageState::default(),
                outdated: Some(doc),
                stored_version,
                dirty: false,
            });
        }

        let state = serde_json::from_value(doc)
            .map_err(|e| InstanceError::ParseError(path.display().to_string(), e.to_string()))?;

        Ok(Inner {
            state,
            outdated: None,
            stored_version,
            dirty: false,
        })
    }

    /// `$DAGSTER_HOME` of a persistent instance
    pub fn home(&self) -> Option<&Path> {
        self.home.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.home.is_none()
    }

    pub fn settings(&self) -> &InstanceSettings {
        &self.settings
    }

    /// Directory for local artifacts and storage
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Instance configuration, rendered as TOML
    pub fn info_str(&self) -> Result<String, InstanceError> {
        let kind = if self.is_ephemeral() { "ephemeral" } else { "local" };
        let mut out = format!(
            "[storage]\ntype = \"{}\"\nbase_dir = \"{}\"\n\n",
            kind,
            self.storage_dir.display()
        );
        out.push_str(&self.settings.to_toml()?);
        Ok(out)
    }

    /// Stored vs. latest schema version, with pending migrations
    pub fn schema_str(&self) -> Result<String, InstanceError> {
        let inner = self.read()?;
        let stored = inner.stored_version;

        let mut out = format!(
            "Instance storage: schema version {stored} (latest {CURRENT_SCHEMA_VERSION})\n"
        );
        let pending: Vec<_> = migrations::pending(stored).collect();
        if pending.is_empty() {
            out.push_str("Up to date.");
        } else {
            out.push_str("Migration required:");
            for migration in pending {
                out.push_str(&format!("\n  {}: {}", migration.version, migration.name));
            }
        }
        Ok(out)
    }

    /// Apply pending storage migrations and persist the result
    pub fn upgrade(&self, print: &mut dyn FnMut(&str)) -> Result<(), InstanceError> {
        {
            let mut inner = self.write()?;
            let Some(mut doc) = inner.outdated.take() else {
                if !self.is_ephemeral() {
                    print("Instance storage is up to date.");
                }
                return Ok(());
            };

            print("Updating instance storage...");
            let original = doc.clone();
            let result = migrations::migrate(&mut doc, print).and_then(|_| {
                serde_json::from_value::<StorageState>(doc).map_err(|e| {
                    InstanceError::ParseError(self.state_path().display().to_string(), e.to_string())
                })
            });

            match result {
                Ok(state) => {
                    inner.stored_version = state.schema_version;
                    inner.state = state;
                    inner.dirty = true;
                }
                Err(err) => {
                    inner.outdated = Some(original);
                    return Err(err);
                }
            }
        }

        self.flush()?;
        print("Done.");
        Ok(())
    }

    /// Rebuild secondary indexes over historical runs
    pub fn reindex(&self, print: &mut dyn FnMut(&str)) -> Result<(), InstanceError> {
        let count = {
            let mut inner = self.write_current()?;
            print("Rebuilding run index...");
            let count = inner.state.run_storage.reindex();
            inner.dirty = true;
            count
        };

        self.flush()?;
        print(&format!("Indexed {count} runs."));
        Ok(())
    }

    // Run storage

    pub fn add_run(&self, run: RunRecord) -> Result<(), InstanceError> {
        let mut inner = self.write_current()?;
        inner.state.run_storage.add_run(run);
        inner.dirty = true;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<RunRecord>, InstanceError> {
        let inner = self.read_current()?;
        Ok(inner.state.run_storage.get_run(run_id).cloned())
    }

    /// Move a run to a new status; a finished run releases its concurrency slots
    pub fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), InstanceError> {
        let mut inner = self.write_current()?;
        if inner.state.run_storage.set_status(run_id, status).is_none() {
            return Err(InstanceError::RunNotFound(run_id.to_string()));
        }
        if status.is_finished() {
            let freed = inner.state.concurrency.free(run_id);
            if freed > 0 {
                tracing::debug!(run_id, freed, "Released concurrency slots");
            }
        }
        inner.dirty = true;
        Ok(())
    }

    pub fn runs_with_status(&self, status: RunStatus) -> Result<Vec<RunRecord>, InstanceError> {
        let inner = self.read_current()?;
        Ok(inner
            .state
            .run_storage
            .runs_with_status(status)
            .into_iter()
            .cloned()
            .collect())
    }

    // Concurrency storage

    /// Keys with a concurrency limit
    pub fn concurrency_limited_keys(&self) -> Result<BTreeSet<String>, InstanceError> {
        Ok(self.read_current()?.state.concurrency.limited_keys())
    }

    /// Live slots of a key
    pub fn concurrency_info(&self, key: &str) -> Result<Vec<ConcurrencySlot>, InstanceError> {
        Ok(self.read_current()?.state.concurrency.info(key))
    }

    /// Set the concurrency limit of a key
    pub fn allocate_concurrency_slots(&self, key: &str, limit: usize) -> Result<(), InstanceError> {
        let mut inner = self.write_current()?;
        inner.state.concurrency.allocate(key, limit);
        inner.dirty = true;
        tracing::info!(key, limit, "Allocated concurrency slots");
        Ok(())
    }

    /// Claim a slot of `key` for a run. Keys without a limit get the default
    /// limit from settings first, if one is configured.
    pub fn claim_concurrency_slot(&self, key: &str, run_id: &str) -> Result<bool, InstanceError> {
        let mut inner = self.write_current()?;
        if !inner.state.concurrency.has_key(key) {
            if let Some(limit) = self.settings.concurrency.default_op_concurrency_limit {
                inner.state.concurrency.allocate(key, limit);
            }
        }
        let claimed = inner.state.concurrency.claim(key, run_id);
        inner.dirty = true;
        Ok(claimed)
    }

    /// Release every slot held by a run
    pub fn free_concurrency_slots(&self, run_id: &str) -> Result<usize, InstanceError> {
        let mut inner = self.write_current()?;
        let freed = inner.state.concurrency.free(run_id);
        inner.dirty = true;
        Ok(freed)
    }

    /// Write pending state of a persistent instance to disk
    pub fn flush(&self) -> Result<(), InstanceError> {
        if self.is_ephemeral() {
            return Ok(());
        }

        let mut inner = self.write()?;
        if !inner.dirty || inner.outdated.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.storage_dir).map_err(|e| {
            InstanceError::IoError(self.storage_dir.display().to_string(), e.to_string())
        })?;

        let json = serde_json::to_string_pretty(&inner.state)
            .map_err(|e| InstanceError::SerializeError(e.to_string()))?;

        // Write then rename so a crash never leaves a truncated state file
        let path = self.state_path();
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .map_err(|e| InstanceError::IoError(tmp.display().to_string(), e.to_string()))?;
        std::fs::rename(&tmp, &path)
            .map_err(|e| InstanceError::IoError(path.display().to_string(), e.to_string()))?;

        inner.dirty = false;
        tracing::debug!(path = %path.display(), "Flushed instance state");
        Ok(())
    }

    fn state_path(&self) -> PathBuf {
        self.storage_dir.join(STATE_FILE_NAME)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, InstanceError> {
        self.inner.read().map_err(|_| InstanceError::LockPoisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, InstanceError> {
        self.inner.write().map_err(|_| InstanceError::LockPoisoned)
    }

    fn read_current(&self) -> Result<RwLockReadGuard<'_, Inner>, InstanceError> {
        let inner = self.read()?;
        inner.check_current()?;
        Ok(inner)
    }

    fn write_current(&self) -> Result<RwLockWriteGuard<'_, Inner>, InstanceError> {
        let inner = self.write()?;
        inner.check_current()?;
        Ok(inner)
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            tracing::warn!(error = %err, "Failed to flush instance state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ephemeral_instance_starts_current_and_empty() {
        let instance = Instance::ephemeral().unwrap();

        assert!(instance.is_ephemeral());
        assert!(instance.home().is_none());
        assert!(instance.storage_dir().is_dir());
        assert!(instance.concurrency_limited_keys().unwrap().is_empty());
        assert!(instance.schema_str().unwrap().ends_with("Up to date."));
    }

    #[test]
    fn ephemeral_scratch_dir_is_removed_on_drop() {
        let instance = Instance::ephemeral().unwrap();
        let scratch = instance.storage_dir().to_path_buf();
        drop(instance);
        assert!(!scratch.exists());
    }

    #[test]
    fn relative_home_is_rejected() {
        assert!(matches!(
            Instance::open(Path::new("relative/home")),
            Err(InstanceError::HomeNotAbsolute(_))
        ));
    }

    #[test]
    fn missing_home_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = Instance::open(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, InstanceError::HomeNotDirectory(_)));
        assert!(err.to_string().contains("$DAGSTER_HOME"));
    }

    #[test]
    fn info_str_lists_storage_and_settings() {
        let dir = tempfile::tempdir().unwrap();
        let instance = Instance::open(dir.path()).unwrap();
        let info = instance.info_str().unwrap();

        assert!(info.starts_with("[storage]\ntype = \"local\""));
        assert!(info.contains("[telemetry]"));
        assert!(info.contains("poll_interval_seconds = 120"));
    }

    #[test]
    fn finished_runs_release_their_slots() {
        let instance = Instance::ephemeral().unwrap();
        instance.allocate_concurrency_slots("snowflake", 1).unwrap();
        instance.add_run(RunRecord::new("r1", "daily")).unwrap();

        assert!(instance.claim_concurrency_slot("snowflake", "r1").unwrap());
        assert!(!instance.claim_concurrency_slot("snowflake", "r2").unwrap());

        instance.update_run_status("r1", RunStatus::Success).unwrap();
        assert!(instance.claim_concurrency_slot("snowflake", "r2").unwrap());
    }

    #[test]
    fn unknown_run_status_update_fails() {
        let instance = Instance::ephemeral().unwrap();
        assert!(matches!(
            instance.update_run_status("missing", RunStatus::Started),
            Err(InstanceError::RunNotFound(_))
        ));
    }

    #[test]
    fn ephemeral_upgrade_is_silent() {
        let instance = Instance::ephemeral().unwrap();
        let mut lines = Vec::new();
        instance.upgrade(&mut |line| lines.push(line.to_string())).unwrap();
        assert_eq!(lines, Vec::<String>::new());
    }
}

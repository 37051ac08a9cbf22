//! Orchestration instance handle
//!
//! This crate handles:
//! - Resolving the instance from `$DAGSTER_HOME` (persistent) or falling back
//!   to an ephemeral in-memory instance
//! - Instance settings (`instance.toml`)
//! - Run storage with a status index
//! - Concurrency slot storage (limits per key, claimed by runs)
//! - Storage schema migrations

pub mod settings;
pub mod runs;
pub mod concurrency;
pub mod migrations;
pub mod instance;

pub use settings::{ConcurrencySettings, InstanceSettings, RunMonitoringSettings, TelemetrySettings};
pub use runs::{RunRecord, RunStatus, RunStorage};
pub use concurrency::{ConcurrencySlot, ConcurrencyTable, SlotCounts};
pub use migrations::{Migration, CURRENT_SCHEMA_VERSION, MIGRATIONS};
pub use instance::{Instance, InstanceError, StorageState, DAGSTER_HOME_ENV};

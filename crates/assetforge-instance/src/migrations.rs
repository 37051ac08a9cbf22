//! Storage schema migrations
//!
//! Migrations run on the raw JSON document, before it is decoded into the
//! current typed state. Each one moves the document up exactly one version.

use serde_json::{Map, Value};

use crate::instance::InstanceError;

/// Schema version written by this build
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Documents without a `schema_version` field predate versioning
const UNVERSIONED: u32 = 1;

/// One schema step
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Version the document has after this migration
    pub version: u32,
    pub name: &'static str,
    apply: fn(&mut Map<String, Value>) -> Result<(), String>,
}

/// All migrations, in order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 2,
        name: "add_run_status_index",
        apply: add_run_status_index,
    },
    Migration {
        version: 3,
        name: "add_concurrency_slots",
        apply: add_concurrency_slots,
    },
];

/// Schema version recorded in a stored document
pub fn stored_version(doc: &Value) -> u32 {
    doc.get("schema_version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(UNVERSIONED)
}

/// Migrations a document at `version` still needs
pub fn pending(version: u32) -> impl Iterator<Item = &'static Migration> {
    MIGRATIONS.iter().filter(move |m| m.version > version)
}

/// Apply pending migrations in order, reporting each through `print`.
/// Returns the number applied.
pub fn migrate(doc: &mut Value, print: &mut dyn FnMut(&str)) -> Result<usize, InstanceError> {
    let version = stored_version(doc);
    if version > CURRENT_SCHEMA_VERSION {
        return Err(InstanceError::SchemaTooNew {
            stored: version,
            current: CURRENT_SCHEMA_VERSION,
        });
    }

    let Some(object) = doc.as_object_mut() else {
        return Err(InstanceError::MigrationFailed {
            version,
            name: "load",
            reason: "storage document is not a JSON object".to_string(),
        });
    };

    let mut applied = 0;
    for migration in pending(version) {
        print(&format!(
            "Applying migration {}: {}",
            migration.version, migration.name
        ));
        (migration.apply)(object).map_err(|reason| InstanceError::MigrationFailed {
            version: migration.version,
            name: migration.name,
            reason,
        })?;
        object.insert("schema_version".to_string(), Value::from(migration.version));
        tracing::info!(version = migration.version, name = migration.name, "Applied migration");
        applied += 1;
    }

    Ok(applied)
}

fn add_run_status_index(doc: &mut Map<String, Value>) -> Result<(), String> {
    let runs = match doc.get("runs") {
        None => Map::new(),
        Some(Value::Object(runs)) => runs.clone(),
        Some(_) => return Err("`runs` is not an object".to_string()),
    };

    let mut index: Map<String, Value> = Map::new();
    for (run_id, run) in &runs {
        let status = run
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("run {run_id} has no status"))?;
        let ids = index
            .entry(status.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(ids) = ids {
            ids.push(Value::from(run_id.as_str()));
        }
    }

    doc.insert("runs".to_string(), Value::Object(runs));
    doc.insert("run_index".to_string(), Value::Object(index));
    Ok(())
}

fn add_concurrency_slots(doc: &mut Map<String, Value>) -> Result<(), String> {
    doc.entry("concurrency")
        .or_insert_with(|| Value::Object(Map::new()));
    Ok(())
}

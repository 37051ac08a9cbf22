//! Run storage
//!
//! Run records keyed by run id, plus a secondary index from status to run
//! ids. The index is derived data: `reindex` rebuilds it from the records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    Started,
    Success,
    Failure,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Started => "STARTED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Canceled => "CANCELED",
        }
    }

    /// A finished run never changes status again
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One stored run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub job_name: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// New queued run
    pub fn new(run_id: impl Into<String>, job_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            job_name: job_name.into(),
            status: RunStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Run records plus the status index
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunStorage {
    #[serde(default)]
    pub runs: BTreeMap<String, RunRecord>,

    /// Status name -> run ids
    #[serde(default)]
    pub run_index: BTreeMap<String, BTreeSet<String>>,
}

impl RunStorage {
    /// Insert or replace a run
    pub fn add_run(&mut self, run: RunRecord) {
        if let Some(previous) = self.runs.get(&run.run_id) {
            let status = previous.status;
            self.unindex(status, &run.run_id);
        }
        self.index(run.status, &run.run_id);
        self.runs.insert(run.run_id.clone(), run);
    }

    pub fn get_run(&self, run_id: &str) -> Option<&RunRecord> {
        self.runs.get(run_id)
    }

    /// Move a run to a new status; returns the previous status
    pub fn set_status(&mut self, run_id: &str, status: RunStatus) -> Option<RunStatus> {
        let run = self.runs.get_mut(run_id)?;
        let previous = run.status;
        run.status = status;
        run.updated_at = Utc::now();

        self.unindex(previous, run_id);
        self.index(status, run_id);
        Some(previous)
    }

    /// Runs with a status, by run id, read through the index
    pub fn runs_with_status(&self, status: RunStatus) -> Vec<&RunRecord> {
        self.run_index
            .get(status.as_str())
            .into_iter()
            .flatten()
            .filter_map(|run_id| self.runs.get(run_id))
            .collect()
    }

    /// Rebuild the status index from the records; returns the number of runs indexed
    pub fn reindex(&mut self) -> usize {
        let mut index: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for run in self.runs.values() {
            index
                .entry(run.status.as_str().to_string())
                .or_default()
                .insert(run.run_id.clone());
        }
        self.run_index = index;
        self.runs.len()
    }

    fn index(&mut self, status: RunStatus, run_id: &str) {
        self.run_index
            .entry(status.as_str().to_string())
            .or_default()
            .insert(run_id.to_string());
    }

    fn unindex(&mut self, status: RunStatus, run_id: &str) {
        if let Some(ids) = self.run_index.get_mut(status.as_str()) {
            ids.remove(run_id);
            if ids.is_empty() {
                self.run_index.remove(status.as_str());
            }
        }
    }
}

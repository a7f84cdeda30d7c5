//! Ingestion run summaries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What started an ingestion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Scheduled,
    Manual,
}

/// Outcome of one source within a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResult {
    /// Raw items returned by the source
    pub fetched: usize,
    /// Items stored for the first time
    pub new: usize,
    /// Known items whose content changed
    pub updated: usize,
    /// Known items re-seen without changes
    pub unchanged: usize,
    /// Malformed items dropped before storage
    pub skipped: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Whether stored data for the source changed in a way feeds can observe.
    pub fn changed_output(&self) -> bool {
        self.new > 0 || self.updated > 0
    }
}

/// Summary of one orchestration cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRun {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub triggered_by: Trigger,
    pub per_source: BTreeMap<String, SourceResult>,
}

impl UpdateRun {
    /// Start a run record; `finished_at` is set by [`UpdateRun::finish`].
    pub fn begin(triggered_by: Trigger) -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            triggered_by,
            per_source: BTreeMap::new(),
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn total_new(&self) -> usize {
        self.per_source.values().map(|r| r.new).sum()
    }

    pub fn failed_sources(&self) -> Vec<&str> {
        self.per_source
            .iter()
            .filter(|(_, r)| !r.is_ok())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

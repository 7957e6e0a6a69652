//! Execution history tracking for scheduled firings.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A record of one firing of one task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FiringRecord {
    pub firing_id: Uuid,
    pub task_id: String,
    pub snapshot_name: String,
    pub fired_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub outcomes: Vec<TargetOutcome>,
}

impl FiringRecord {
    /// Clusters whose unit of work failed.
    pub fn failed_clusters(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.error.is_some())
            .map(|o| o.cluster.as_str())
            .collect()
    }

    /// One-line summary of every failure, `None` when nothing failed.
    pub fn error_summary(&self) -> Option<String> {
        let failures: Vec<String> = self
            .outcomes
            .iter()
            .filter_map(|o| o.error.as_ref().map(|e| format!("cluster {}: {}", o.cluster, e)))
            .collect();
        if failures.is_empty() {
            None
        } else {
            Some(failures.join("; "))
        }
    }
}

/// Result of the unit of work against one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// Every target produced a snapshot.
    Success,
    /// Some targets failed, at least one succeeded.
    PartialFailure,
    /// Every target failed.
    Failed,
    /// The firing never reached a target (e.g. current cluster unresolvable).
    Aborted,
}

impl RunStatus {
    /// Classify a set of per-target outcomes.
    pub fn classify(outcomes: &[TargetOutcome]) -> Self {
        let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
        match (outcomes.len(), failed) {
            (0, _) => RunStatus::Aborted,
            (_, 0) => RunStatus::Success,
            (total, f) if f == total => RunStatus::Failed,
            _ => RunStatus::PartialFailure,
        }
    }
}

/// Bounded, in-memory, per-task firing history. Newest first.
pub struct FiringHistory {
    limit: usize,
    records: Mutex<HashMap<String, VecDeque<FiringRecord>>>,
}

impl FiringHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, VecDeque<FiringRecord>>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, record: FiringRecord) {
        let mut records = self.records();
        let ring = records.entry(record.task_id.clone()).or_default();
        ring.push_front(record);
        ring.truncate(self.limit);
    }

    pub fn for_task(&self, task_id: &str) -> Vec<FiringRecord> {
        self.records()
            .get(task_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, task_id: &str) -> Option<FiringRecord> {
        self.records().get(task_id).and_then(|ring| ring.front().cloned())
    }

    pub fn forget(&self, task_id: &str) {
        self.records().remove(task_id);
    }
}

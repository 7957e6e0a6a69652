//! Execution engine: performs one firing of one task.
//!
//! The target set is resolved at fire time. Each target gets its own tokio
//! task; the firing waits for all of them, classifies the collected
//! outcomes and records the result. Nothing here returns an error to the
//! caller: every failure ends up in the [`FiringRecord`] and the logs.

pub mod target;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterRegistry;
use crate::config::MultiClusterPolicy;
use crate::scheduler::history::{FiringHistory, FiringRecord, RunStatus, TargetOutcome};
use crate::task::ScheduledTask;

pub use self::target::TargetError;

pub struct ExecutionEngine {
    clusters: Arc<dyn ClusterRegistry>,
    history: Arc<FiringHistory>,
    policy: MultiClusterPolicy,
}

impl ExecutionEngine {
    pub fn new(
        clusters: Arc<dyn ClusterRegistry>,
        history: Arc<FiringHistory>,
        policy: MultiClusterPolicy,
    ) -> Self {
        Self {
            clusters,
            history,
            policy,
        }
    }

    pub fn clusters(&self) -> &Arc<dyn ClusterRegistry> {
        &self.clusters
    }

    pub fn history(&self) -> &Arc<FiringHistory> {
        &self.history
    }

    /// Clusters a firing of `task` should reach right now, or `None` when the
    /// firing must not run at all.
    pub fn resolve_targets(&self, task: &ScheduledTask) -> Option<Vec<String>> {
        if task.target_clusters.is_empty() {
            return Some(vec![self.clusters.current_cluster_name()]);
        }

        if !self.clusters.supports_multi_cluster() {
            let current = self.clusters.current_cluster_name();
            return match self.policy {
                MultiClusterPolicy::Fallback => {
                    warn!(
                        task_id = %task.id,
                        requested = ?task.target_clusters,
                        cluster = %current,
                        "Multi-cluster routing unavailable, falling back to current cluster"
                    );
                    Some(vec![current])
                }
                MultiClusterPolicy::Reject => {
                    error!(
                        task_id = %task.id,
                        requested = ?task.target_clusters,
                        "Multi-cluster routing unavailable, skipping firing"
                    );
                    None
                }
            };
        }

        let mut targets: Vec<String> = Vec::with_capacity(task.target_clusters.len());
        for cluster in &task.target_clusters {
            if !targets.contains(cluster) {
                targets.push(cluster.clone());
            }
        }
        Some(targets)
    }

    /// Perform one firing of `task` at `fired_at`. The task must already be
    /// stamped by the caller; the definition passed in is used unchanged for
    /// the whole firing.
    pub async fn fire(&self, task: &ScheduledTask, fired_at: DateTime<Utc>) -> FiringRecord {
        let snapshot_name = task.snapshot_name(fired_at);
        let spec = Arc::new(task.snapshot_spec(&snapshot_name, fired_at));

        let targets = self.resolve_targets(task).unwrap_or_default();
        info!(
            task_id = %task.id,
            snapshot = %snapshot_name,
            targets = ?targets,
            "Firing scheduled snapshot"
        );

        // Scatter: one unit of work per cluster, none cancels the others.
        let units: Vec<_> = targets
            .into_iter()
            .map(|cluster| {
                let clusters = self.clusters.clone();
                let spec = spec.clone();
                let name = cluster.clone();
                let handle = tokio::spawn(async move {
                    target::snapshot_on(clusters.as_ref(), &name, &spec).await
                });
                (cluster, handle)
            })
            .collect();

        // Gather in target order.
        let mut outcomes = Vec::with_capacity(units.len());
        for (cluster, handle) in units {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(task_id = %task.id, cluster = %cluster, error = %e, "Target unit aborted");
                    Err(TargetError::Interrupted(e.to_string()))
                }
            };
            outcomes.push(match result {
                Ok(created) => TargetOutcome {
                    cluster,
                    snapshot: Some(created.name),
                    error: None,
                },
                Err(e) => TargetOutcome {
                    cluster,
                    snapshot: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let record = FiringRecord {
            firing_id: Uuid::new_v4(),
            task_id: task.id.clone(),
            snapshot_name,
            fired_at,
            finished_at: Utc::now(),
            status: RunStatus::classify(&outcomes),
            outcomes,
        };
        log_summary(&record);
        self.history.record(record.clone());
        record
    }
}

fn log_summary(record: &FiringRecord) {
    let elapsed_ms = (record.finished_at - record.fired_at).num_milliseconds();
    match record.status {
        RunStatus::Success => info!(
            task_id = %record.task_id,
            snapshot = %record.snapshot_name,
            clusters = record.outcomes.len(),
            elapsed_ms,
            "Firing complete"
        ),
        RunStatus::PartialFailure => warn!(
            task_id = %record.task_id,
            snapshot = %record.snapshot_name,
            failed = ?record.failed_clusters(),
            summary = %record.error_summary().unwrap_or_default(),
            "Firing partially failed"
        ),
        RunStatus::Failed => error!(
            task_id = %record.task_id,
            snapshot = %record.snapshot_name,
            summary = %record.error_summary().unwrap_or_default(),
            "Firing failed on every target"
        ),
        RunStatus::Aborted => error!(
            task_id = %record.task_id,
            snapshot = %record.snapshot_name,
            "Firing aborted before reaching any cluster"
        ),
    }
}

//! Scheduled snapshot task model.
//!
//! A [`ScheduledTask`] is the durable policy: what volume to snapshot, with
//! which class, on which schedule, and against which clusters. The
//! [`TaskDefinition`] is the user-submitted subset used by create and update.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value of the `app` label stamped on every snapshot this service creates.
pub const APP_LABEL: &str = "snapcadence";

/// Prefix for snapshot annotations.
pub const ANNOTATION_PREFIX: &str = "snapcadence";

/// A recurring snapshot policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub name: String,
    pub namespace: String,
    #[serde(alias = "pvcName")]
    pub source_volume_name: String,
    #[serde(alias = "volumeSnapshotClassName")]
    pub snapshot_class_name: String,
    /// Six-field expression: second minute hour day-of-month month day-of-week.
    pub cron_expression: String,
    #[serde(default)]
    pub enabled: bool,
    /// Empty means "the cluster that is current at fire time".
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_clusters: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    /// Derived from the live registration on read; never persisted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    /// Build a new task from a definition. The id is derived from
    /// `{namespace}-{name}-{epoch}` of the creation instant.
    pub fn from_definition(def: TaskDefinition, created_by: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: task_id(&def.namespace, &def.name, now),
            name: def.name,
            namespace: def.namespace,
            source_volume_name: def.source_volume_name,
            snapshot_class_name: def.snapshot_class_name,
            cron_expression: def.cron_expression,
            enabled: true,
            target_clusters: def.target_clusters,
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
            last_executed: None,
            next_execution: None,
        }
    }

    /// Apply an update. Identity and provenance fields are preserved;
    /// `enabled` is only changed when the definition carries it.
    pub fn apply(&self, def: TaskDefinition, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id.clone(),
            name: def.name,
            namespace: def.namespace,
            source_volume_name: def.source_volume_name,
            snapshot_class_name: def.snapshot_class_name,
            cron_expression: def.cron_expression,
            enabled: def.enabled.unwrap_or(self.enabled),
            target_clusters: def.target_clusters,
            created_by: self.created_by.clone(),
            created_at: self.created_at,
            updated_at: now,
            last_executed: self.last_executed,
            next_execution: None,
        }
    }

    /// Snapshot name for a firing at `fired_at`: `{name}-{epochSeconds}`.
    pub fn snapshot_name(&self, fired_at: DateTime<Utc>) -> String {
        format!("{}-{}", self.name, fired_at.timestamp())
    }

    /// Build the snapshot request for one firing. Labels and annotations carry
    /// the task identity and creator for later audit and ownership queries.
    pub fn snapshot_spec(&self, snapshot_name: &str, fired_at: DateTime<Utc>) -> SnapshotSpec {
        let mut labels = BTreeMap::new();
        labels.insert("scheduled-task-id".to_string(), label_value(&self.id));
        labels.insert("scheduled-task-name".to_string(), label_value(&self.name));
        labels.insert("created-by".to_string(), label_value(&self.created_by));
        labels.insert("app".to_string(), APP_LABEL.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(
            format!("{ANNOTATION_PREFIX}/created-by"),
            self.created_by.clone(),
        );
        annotations.insert(format!("{ANNOTATION_PREFIX}/scheduled-task"), self.id.clone());
        annotations.insert(
            format!("{ANNOTATION_PREFIX}/created-at"),
            fired_at.to_rfc3339(),
        );

        SnapshotSpec {
            name: snapshot_name.to_string(),
            namespace: self.namespace.clone(),
            source_volume_name: self.source_volume_name.clone(),
            snapshot_class_name: self.snapshot_class_name.clone(),
            labels,
            annotations,
        }
    }
}

/// User-submitted fields for create and update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub name: String,
    pub namespace: String,
    #[serde(alias = "pvcName")]
    pub source_volume_name: String,
    #[serde(alias = "volumeSnapshotClassName")]
    pub snapshot_class_name: String,
    pub cron_expression: String,
    /// Ignored on create (tasks always start enabled).
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub target_clusters: Vec<String>,
}

impl TaskDefinition {
    /// Return the name of the first required field that is blank.
    pub fn missing_field(&self) -> Option<&'static str> {
        [
            ("name", &self.name),
            ("namespace", &self.namespace),
            ("sourceVolumeName", &self.source_volume_name),
            ("snapshotClassName", &self.snapshot_class_name),
            ("cronExpression", &self.cron_expression),
        ]
        .into_iter()
        .find(|(_, value)| value.trim().is_empty())
        .map(|(field, _)| field)
    }
}

/// Everything a cluster needs to create one volume snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    pub name: String,
    pub namespace: String,
    pub source_volume_name: String,
    pub snapshot_class_name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Observability view of a single task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    pub id: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_execution: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Derive a task id from its namespace, name and creation instant.
pub fn task_id(namespace: &str, name: &str, created_at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", namespace, name, created_at.timestamp())
}

/// Coerce an arbitrary string into a valid Kubernetes label value:
/// at most 63 characters of `[A-Za-z0-9-_.]`, alphanumeric at both ends.
fn label_value(raw: &str) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .take(63)
        .collect();
    mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn definition() -> TaskDefinition {
        TaskDefinition {
            name: "db-backup".to_string(),
            namespace: "prod".to_string(),
            source_volume_name: "db-pvc".to_string(),
            snapshot_class_name: "fast".to_string(),
            cron_expression: "0 0 * * * *".to_string(),
            enabled: Some(false),
            target_clusters: vec![],
        }
    }

    #[test]
    fn test_id_uses_namespace_name_and_epoch() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let task = ScheduledTask::from_definition(definition(), "alice", now);
        assert_eq!(task.id, format!("prod-db-backup-{}", now.timestamp()));
        assert!(task.enabled, "new tasks are always enabled");
        assert_eq!(task.created_by, "alice");
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_apply_preserves_identity_and_provenance() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut task = ScheduledTask::from_definition(definition(), "alice", created);
        task.last_executed = Some(created);

        let later = created + chrono::Duration::minutes(5);
        let mut def = definition();
        def.cron_expression = "0 */5 * * * *".to_string();
        def.enabled = None;
        let updated = task.apply(def, later);

        assert_eq!(updated.id, task.id);
        assert_eq!(updated.created_at, created);
        assert_eq!(updated.created_by, "alice");
        assert_eq!(updated.last_executed, Some(created));
        assert_eq!(updated.updated_at, later);
        assert!(updated.enabled);
        assert_eq!(updated.cron_expression, "0 */5 * * * *");
    }

    #[test]
    fn test_snapshot_spec_carries_task_metadata() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let task = ScheduledTask::from_definition(definition(), "alice", now);
        let name = task.snapshot_name(now);
        assert_eq!(name, format!("db-backup-{}", now.timestamp()));

        let spec = task.snapshot_spec(&name, now);
        assert_eq!(spec.source_volume_name, "db-pvc");
        assert_eq!(spec.snapshot_class_name, "fast");
        assert_eq!(spec.labels["scheduled-task-id"], task.id);
        assert_eq!(spec.labels["created-by"], "alice");
        assert_eq!(spec.labels["app"], APP_LABEL);
        assert_eq!(spec.annotations["snapcadence/scheduled-task"], task.id);
        assert_eq!(spec.annotations["snapcadence/created-at"], now.to_rfc3339());
    }

    #[test]
    fn test_label_value_sanitises() {
        assert_eq!(label_value("alice@example.com"), "alice_example.com");
        assert_eq!(label_value("-edge-"), "edge");
        assert_eq!(label_value(&"x".repeat(80)).len(), 63);
    }

    #[test]
    fn test_missing_field_reports_first_blank() {
        let mut def = definition();
        assert_eq!(def.missing_field(), None);
        def.source_volume_name = "  ".to_string();
        assert_eq!(def.missing_field(), Some("sourceVolumeName"));
    }

    #[test]
    fn test_legacy_field_names_deserialize() {
        let json = r#"{
            "id": "prod-db-1",
            "name": "db",
            "namespace": "prod",
            "pvcName": "db-pvc",
            "volumeSnapshotClassName": "fast",
            "cronExpression": "0 0 * * * *",
            "enabled": true,
            "createdAt": "2024-05-01T12:00:00Z",
            "updatedAt": "2024-05-01T12:00:00Z"
        }"#;
        let task: ScheduledTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.source_volume_name, "db-pvc");
        assert_eq!(task.snapshot_class_name, "fast");
        assert!(task.target_clusters.is_empty());
    }
}

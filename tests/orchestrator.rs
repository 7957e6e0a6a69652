//! Orchestrator behaviour against a deterministic cron engine and in-memory
//! clusters.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use snapcadence::cluster::{MemoryCluster, MemoryClusters};
use snapcadence::orchestrator::{Orchestrator, OrchestratorOptions, TaskError, ValidationError};
use snapcadence::scheduler::history::RunStatus;
use snapcadence::scheduler::{CronEngine, ManualCronEngine, TokioCronEngine};
use snapcadence::storage::{JsonFileStore, TaskStore};
use snapcadence::task::TaskDefinition;
use tempfile::TempDir;

fn definition(name: &str, cron: &str) -> TaskDefinition {
    TaskDefinition {
        name: name.to_string(),
        namespace: "prod".to_string(),
        source_volume_name: "db-pvc".to_string(),
        snapshot_class_name: "fast".to_string(),
        cron_expression: cron.to_string(),
        ..Default::default()
    }
}

fn single_cluster() -> (Arc<MemoryCluster>, Arc<MemoryClusters>) {
    let east = Arc::new(MemoryCluster::new("east").with_volume("prod", "db-pvc"));
    let clusters = Arc::new(MemoryClusters::new("east").with_cluster(east.clone()));
    (east, clusters)
}

async fn open(
    dir: &TempDir,
    engine: Arc<dyn CronEngine>,
    clusters: Arc<MemoryClusters>,
) -> Orchestrator {
    let store = Arc::new(JsonFileStore::new(dir.path().join("data").join("tasks.json")));
    Orchestrator::start(store, engine, clusters, OrchestratorOptions::default()).await
}

#[tokio::test]
async fn test_valid_expressions_get_future_next_execution() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let orchestrator = open(&dir, Arc::new(TokioCronEngine::new()), clusters).await;

    let expressions = [
        "0 0 * * * *",
        "*/10 * * * * *",
        "0 30 2 * * *",
        "0 0 12 1 * *",
        "0 0 0 * * Mon",
        "15 45 23 31 12 *",
    ];
    for (i, expr) in expressions.iter().enumerate() {
        let task = orchestrator
            .create_task(definition(&format!("t{i}"), expr), "alice")
            .await
            .unwrap_or_else(|e| panic!("{expr} rejected: {e}"));
        assert!(task.enabled);
    }

    let tasks = orchestrator.list_tasks().await;
    assert_eq!(tasks.len(), expressions.len());
    for task in tasks {
        let next = task.next_execution.expect("enabled task has a next execution");
        assert!(next > task.created_at, "{}: {next} <= {}", task.cron_expression, task.created_at);
    }
}

#[tokio::test]
async fn test_malformed_expressions_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    for expr in ["0 * * * *", "* * * * * * * *", "", "every hour", "61 * * * * *"] {
        let err = orchestrator
            .create_task(definition("bad", expr), "alice")
            .await
            .unwrap_err();
        assert!(
            matches!(err, TaskError::Validation(_)),
            "{expr:?} gave {err:?}"
        );
    }
    assert!(orchestrator.list_tasks().await.is_empty());
    assert!(engine.is_empty());
    assert!(!dir.path().join("data").join("tasks.json").exists());
}

#[tokio::test]
async fn test_five_field_error_names_expression() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let orchestrator = open(&dir, Arc::new(ManualCronEngine::new()), clusters).await;

    let err = orchestrator
        .create_task(definition("db", "0 * * * *"), "alice")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TaskError::Validation(ValidationError::InvalidSchedule(_))
    ));
    assert!(err.to_string().contains("0 * * * *"));
}

#[tokio::test]
async fn test_toggle_twice_restores_state() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    assert!(orchestrator.registration(&task.id).await.is_some());

    let off = orchestrator.toggle_task(&task.id).await.unwrap();
    assert!(!off.enabled);
    assert!(off.next_execution.is_none());
    assert!(orchestrator.registration(&task.id).await.is_none());
    assert_eq!(engine.len(), 0);

    let on = orchestrator.toggle_task(&task.id).await.unwrap();
    assert!(on.enabled);
    assert!(on.next_execution.is_some());
    assert!(orchestrator.registration(&task.id).await.is_some());
    assert_eq!(engine.len(), 1);

    assert!(matches!(
        orchestrator.toggle_task("nope").await,
        Err(TaskError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_restart_registers_only_enabled_tasks() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();

    let (enabled_id, disabled_id) = {
        let orchestrator = open(&dir, Arc::new(ManualCronEngine::new()), clusters.clone()).await;
        let a = orchestrator
            .create_task(definition("a", "0 0 * * * *"), "alice")
            .await
            .unwrap();
        let b = orchestrator
            .create_task(definition("b", "0 30 * * * *"), "alice")
            .await
            .unwrap();
        orchestrator.toggle_task(&b.id).await.unwrap();
        (a.id, b.id)
    };

    let engine = Arc::new(ManualCronEngine::new());
    let restarted = open(&dir, engine.clone(), clusters).await;

    assert_eq!(restarted.list_tasks().await.len(), 2);
    assert_eq!(restarted.registered_count().await, 1);
    assert_eq!(engine.len(), 1);
    assert!(restarted.registration(&enabled_id).await.is_some());
    assert!(restarted.registration(&disabled_id).await.is_none());
    assert!(!restarted.get_task(&disabled_id).await.unwrap().enabled);
}

#[tokio::test]
async fn test_round_trip_through_fresh_instance() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();

    let before = {
        let orchestrator = open(&dir, Arc::new(ManualCronEngine::new()), clusters.clone()).await;
        let mut def = definition("db", "0 0 * * * *");
        def.target_clusters = vec!["east".to_string(), "west".to_string()];
        orchestrator.create_task(def, "alice").await.unwrap();
        orchestrator
            .create_task(definition("logs", "0 15 * * * *"), "bob")
            .await
            .unwrap();
        orchestrator.list_tasks().await
    };

    let store = JsonFileStore::new(dir.path().join("data").join("tasks.json"));
    let loaded = store.load();
    assert_eq!(loaded.len(), 2);
    for (stored, live) in loaded.iter().zip(&before) {
        let mut expected = live.clone();
        expected.next_execution = None;
        assert_eq!(stored, &expected);
    }
}

#[tokio::test]
async fn test_fan_out_isolates_precondition_failure() {
    let dir = TempDir::new().unwrap();
    let a = Arc::new(MemoryCluster::new("a").with_volume("prod", "db-pvc"));
    let b = Arc::new(MemoryCluster::new("b").with_volume("prod", "other-pvc"));
    let c = Arc::new(MemoryCluster::new("c").with_volume("prod", "db-pvc"));
    let clusters = Arc::new(
        MemoryClusters::new("a")
            .with_cluster(a.clone())
            .with_cluster(b.clone())
            .with_cluster(c.clone()),
    );
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    let mut def = definition("db", "0 0 * * * *");
    def.target_clusters = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let task = orchestrator.create_task(def, "alice").await.unwrap();
    assert!(task.last_executed.is_none());

    let handle = orchestrator.registration(&task.id).await.unwrap();
    assert!(engine.fire(handle).await);

    assert_eq!(a.snapshots().len(), 1);
    assert!(b.snapshots().is_empty());
    assert_eq!(c.snapshots().len(), 1);

    let history = orchestrator.history(&task.id).await.unwrap();
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.status, RunStatus::PartialFailure);
    assert_eq!(record.failed_clusters(), vec!["b"]);
    assert!(record.outcomes[1]
        .error
        .as_deref()
        .unwrap()
        .contains("not found on cluster b"));

    let current = orchestrator.get_task(&task.id).await.unwrap();
    assert_eq!(current.last_executed, Some(record.fired_at));

    // The task stays scheduled after a partial failure.
    assert!(orchestrator.registration(&task.id).await.is_some());
    let snapshot = &a.snapshots()[0];
    assert_eq!(snapshot.labels["scheduled-task-id"], task.id);
    assert_eq!(snapshot.annotations["snapcadence/created-by"], "alice");
}

#[tokio::test]
async fn test_delete_removes_task_and_engine_entry() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    let handle = orchestrator.registration(&task.id).await.unwrap();
    assert!(engine.contains(handle));

    orchestrator.delete_task(&task.id).await.unwrap();

    assert!(orchestrator.list_tasks().await.is_empty());
    assert!(!engine.contains(handle));
    assert!(!engine.fire(handle).await);
    let store = JsonFileStore::new(dir.path().join("data").join("tasks.json"));
    assert!(store.load().is_empty());
}

#[tokio::test]
async fn test_example_scenario_hourly_backup() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let clock = Utc.with_ymd_and_hms(2024, 5, 1, 12, 34, 56).unwrap();
    let orchestrator = open(&dir, Arc::new(ManualCronEngine::at(clock)), clusters).await;

    let task = orchestrator
        .create_task(definition("db-backup", "0 0 * * * *"), "alice")
        .await
        .unwrap();

    assert_eq!(task.id, format!("prod-db-backup-{}", task.created_at.timestamp()));
    assert!(task.enabled);
    assert_eq!(
        task.next_execution,
        Some(Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_firing_writes_last_executed_to_disk() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;
    let store = JsonFileStore::new(dir.path().join("data").join("tasks.json"));

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    assert!(store.load()[0].last_executed.is_none());

    let handle = orchestrator.registration(&task.id).await.unwrap();
    assert!(engine.fire(handle).await);
    let fired = orchestrator.get_task(&task.id).await.unwrap().last_executed;
    assert!(fired.is_some());
    assert_eq!(store.load()[0].last_executed, fired);

    let record = orchestrator.run_now(&task.id).await.unwrap();
    assert_eq!(store.load()[0].last_executed, Some(record.fired_at));
}

#[tokio::test]
async fn test_persistence_failure_is_not_fatal() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();

    let (_, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let store = Arc::new(JsonFileStore::new(blocker.join("tasks.json")));
    let orchestrator =
        Orchestrator::start(store, engine.clone(), clusters, OrchestratorOptions::default()).await;

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    assert_eq!(orchestrator.list_tasks().await.len(), 1);
    assert!(orchestrator.registration(&task.id).await.is_some());
    assert_eq!(engine.len(), 1);
}

#[tokio::test]
async fn test_update_replaces_registration() {
    let dir = TempDir::new().unwrap();
    let (east, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    let old_handle = orchestrator.registration(&task.id).await.unwrap();

    let mut def = definition("db", "0 30 * * * *");
    def.snapshot_class_name = "slow".to_string();
    orchestrator.update_task(&task.id, def).await.unwrap();
    let new_handle = orchestrator.registration(&task.id).await.unwrap();

    assert_ne!(old_handle, new_handle);
    assert!(!engine.contains(old_handle));
    assert_eq!(engine.len(), 1);

    assert!(engine.fire(new_handle).await);
    assert_eq!(east.snapshots()[0].snapshot_class_name, "slow");

    let updated = orchestrator.get_task(&task.id).await.unwrap();
    assert_eq!(updated.created_at, task.created_at);
    assert_eq!(updated.created_by, "alice");
    assert!(updated.updated_at >= task.updated_at);
    assert!(updated.last_executed.is_some());
}

#[tokio::test]
async fn test_in_flight_firing_keeps_its_definition_across_update() {
    let dir = TempDir::new().unwrap();
    let (east, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = open(&dir, engine.clone(), clusters).await;

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();
    let handle = orchestrator.registration(&task.id).await.unwrap();

    east.hold_listings();
    let firing = tokio::spawn({
        let engine = engine.clone();
        async move { engine.fire(handle).await }
    });
    east.listing_started().await;

    let stamped = orchestrator.get_task(&task.id).await.unwrap().last_executed;
    assert!(stamped.is_some());

    let mut def = definition("db", "0 30 * * * *");
    def.snapshot_class_name = "slow".to_string();
    orchestrator.update_task(&task.id, def).await.unwrap();
    assert!(!engine.contains(handle));

    east.release_listings();
    assert!(firing.await.unwrap());

    let snapshots = east.snapshots();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].snapshot_class_name, "fast");

    let history = orchestrator.history(&task.id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Success);
    let current = orchestrator.get_task(&task.id).await.unwrap();
    assert_eq!(current.last_executed, stamped);
    assert_eq!(current.snapshot_class_name, "slow");
}

#[tokio::test]
async fn test_in_flight_firing_completes_after_delete() {
    let dir = TempDir::new().unwrap();
    let (east, clusters) = single_cluster();
    let engine = Arc::new(ManualCronEngine::new());
    let orchestrator = Arc::new(open(&dir, engine.clone(), clusters).await);

    let task = orchestrator
        .create_task(definition("db", "0 0 * * * *"), "alice")
        .await
        .unwrap();

    east.hold_listings();
    let firing = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let id = task.id.clone();
        async move { orchestrator.run_now(&id).await }
    });
    east.listing_started().await;

    orchestrator.delete_task(&task.id).await.unwrap();
    east.release_listings();

    let record = firing.await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(east.snapshots().len(), 1);

    assert!(orchestrator.list_tasks().await.is_empty());
    tokio_test::assert_err!(orchestrator.history(&task.id).await);
    let store = JsonFileStore::new(dir.path().join("data").join("tasks.json"));
    assert!(store.load().is_empty());
}

#[test]
fn test_orchestrator_is_shareable() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Orchestrator>();
}

#[tokio::test]
async fn test_run_now_unknown_task() {
    let dir = TempDir::new().unwrap();
    let (_, clusters) = single_cluster();
    let orchestrator = open(&dir, Arc::new(ManualCronEngine::new()), clusters).await;
    tokio_test::assert_err!(orchestrator.run_now("missing").await);
    tokio_test::assert_err!(orchestrator.status("missing").await);
    tokio_test::assert_err!(orchestrator.history("missing").await);
}

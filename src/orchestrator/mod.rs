//! Orchestrator facade: CRUD over scheduled tasks.
//!
//! The task map and the scheduler registry live together behind one
//! `tokio::sync::RwLock`. Every mutation takes the write lock for the whole
//! compound step (map, registry, disk), so the three never drift apart.
//! Reads share the lock and see a consistent view including derived
//! next-fire times.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use futures::FutureExt;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterRegistry;
use crate::config::MultiClusterPolicy;
use crate::executor::ExecutionEngine;
use crate::scheduler::history::{FiringHistory, FiringRecord};
use crate::scheduler::{self, CronEngine, EntryId, InvalidScheduleError, Job, SchedulerRegistry, SchedulingError};
use crate::storage::TaskStore;
use crate::task::{ScheduledTask, TaskDefinition, TaskStatus};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    InvalidSchedule(#[from] InvalidScheduleError),

    #[error("target clusters {0:?} requested but multi-cluster routing is not supported")]
    MultiClusterUnsupported(Vec<String>),
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid task: {0}")]
    Validation(#[from] ValidationError),

    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    AlreadyExists(String),

    #[error("failed to schedule task: {0}")]
    Scheduling(#[from] SchedulingError),
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub policy: MultiClusterPolicy,
    pub history_limit: usize,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            policy: MultiClusterPolicy::Fallback,
            history_limit: 20,
        }
    }
}

/// One upcoming fire instant, as reported by [`Orchestrator::preview`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcomingRun {
    pub task_id: String,
    pub task_name: String,
    pub at: DateTime<Utc>,
}

struct TaskSet {
    tasks: HashMap<String, ScheduledTask>,
    registry: SchedulerRegistry,
}

impl TaskSet {
    /// Copy of `task` with its derived next-fire time filled in.
    fn view(&self, task: &ScheduledTask) -> ScheduledTask {
        let mut view = task.clone();
        view.next_execution = self.registry.next_fire_time(&task.id);
        view
    }

    fn ordered(&self) -> Vec<ScheduledTask> {
        let mut tasks: Vec<ScheduledTask> = self.tasks.values().map(|t| self.view(t)).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }
}

pub struct Orchestrator {
    state: Arc<RwLock<TaskSet>>,
    store: Arc<dyn TaskStore>,
    executor: Arc<ExecutionEngine>,
    options: OrchestratorOptions,
}

impl Orchestrator {
    /// Load persisted tasks and re-register every enabled one. The cron
    /// engine is driven by the caller; this only installs entries.
    pub async fn start(
        store: Arc<dyn TaskStore>,
        engine: Arc<dyn CronEngine>,
        clusters: Arc<dyn ClusterRegistry>,
        options: OrchestratorOptions,
    ) -> Self {
        let history = Arc::new(FiringHistory::new(options.history_limit));
        let executor = Arc::new(ExecutionEngine::new(clusters, history, options.policy));
        let state = Arc::new(RwLock::new(TaskSet {
            tasks: HashMap::new(),
            registry: SchedulerRegistry::new(engine),
        }));
        let orchestrator = Self {
            state,
            store,
            executor,
            options,
        };
        orchestrator.restore().await;
        orchestrator
    }

    async fn restore(&self) {
        let loaded = self.store.load();
        let mut set = self.state.write().await;
        let mut registered = 0usize;

        for task in loaded {
            if set.tasks.contains_key(&task.id) {
                warn!(task_id = %task.id, "Duplicate task id in task file, keeping first");
                continue;
            }
            if task.enabled {
                match set.registry.register(&task, self.job_for(&task)) {
                    Ok(_) => registered += 1,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Failed to register task on restore");
                    }
                }
            }
            set.tasks.insert(task.id.clone(), task);
        }

        info!(tasks = set.tasks.len(), registered, "Scheduled tasks restored");
    }

    /// Fire callback for `task`. It holds a frozen copy of the definition and
    /// a weak reference to the task set; once the orchestrator is dropped the
    /// job does nothing.
    fn job_for(&self, task: &ScheduledTask) -> Job {
        let state: Weak<RwLock<TaskSet>> = Arc::downgrade(&self.state);
        let store = self.store.clone();
        let executor = self.executor.clone();
        let task = Arc::new(task.clone());

        Arc::new(move || {
            let state = state.clone();
            let store = store.clone();
            let executor = executor.clone();
            let task = task.clone();
            async move {
                let Some(state) = state.upgrade() else {
                    return;
                };
                let fired_at = Utc::now();
                if stamp_last_executed(&state, store.as_ref(), &task.id, fired_at)
                    .await
                    .is_none()
                {
                    debug!(task_id = %task.id, "Task removed before firing, skipping");
                    return;
                }
                fire_and_settle(&state, &executor, &task, fired_at).await;
            }
            .boxed()
        })
    }

    fn validate(&self, def: &TaskDefinition) -> Result<(), ValidationError> {
        if let Some(field) = def.missing_field() {
            return Err(ValidationError::MissingField(field));
        }
        scheduler::parse(&def.cron_expression)?;
        if self.options.policy == MultiClusterPolicy::Reject
            && !def.target_clusters.is_empty()
            && !self.executor.clusters().supports_multi_cluster()
        {
            return Err(ValidationError::MultiClusterUnsupported(def.target_clusters.clone()));
        }
        Ok(())
    }

    /// Mirror the task set to disk. Failures are logged and swallowed; the
    /// in-memory set stays authoritative.
    fn persist(&self, set: &TaskSet) {
        persist_tasks(self.store.as_ref(), set);
    }

    /// All tasks ordered by creation, with `next_execution` derived from the
    /// live registrations.
    pub async fn list_tasks(&self) -> Vec<ScheduledTask> {
        self.state.read().await.ordered()
    }

    pub async fn get_task(&self, id: &str) -> Result<ScheduledTask, TaskError> {
        let set = self.state.read().await;
        set.tasks
            .get(id)
            .map(|t| set.view(t))
            .ok_or_else(|| TaskError::NotFound(id.to_string()))
    }

    pub async fn status(&self, id: &str) -> Result<TaskStatus, TaskError> {
        let task = self.get_task(id).await?;
        let error_message = self
            .executor
            .history()
            .latest(id)
            .and_then(|record| record.error_summary());
        Ok(TaskStatus {
            id: task.id,
            enabled: task.enabled,
            last_executed: task.last_executed,
            next_execution: task.next_execution,
            error_message,
        })
    }

    pub async fn create_task(
        &self,
        def: TaskDefinition,
        created_by: &str,
    ) -> Result<ScheduledTask, TaskError> {
        self.validate(&def)?;
        let task = ScheduledTask::from_definition(def, created_by, Utc::now());

        let mut set = self.state.write().await;
        if set.tasks.contains_key(&task.id) {
            return Err(TaskError::AlreadyExists(task.id));
        }
        let job = self.job_for(&task);
        set.registry.register(&task, job)?;
        set.tasks.insert(task.id.clone(), task.clone());
        self.persist(&set);

        info!(task_id = %task.id, cron = %task.cron_expression, created_by = %task.created_by, "Task created");
        Ok(set.view(&task))
    }

    pub async fn update_task(
        &self,
        id: &str,
        def: TaskDefinition,
    ) -> Result<ScheduledTask, TaskError> {
        self.validate(&def)?;

        let mut set = self.state.write().await;
        let previous = set
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        let updated = previous.apply(def, Utc::now());

        if updated.enabled {
            let job = self.job_for(&updated);
            if let Err(e) = set.registry.register(&updated, job) {
                if previous.enabled {
                    let job = self.job_for(&previous);
                    if let Err(restore) = set.registry.register(&previous, job) {
                        error!(task_id = %id, error = %restore, "Failed to restore prior registration");
                    }
                }
                return Err(e.into());
            }
        } else {
            set.registry.unregister(id);
        }

        set.tasks.insert(updated.id.clone(), updated.clone());
        self.persist(&set);

        info!(task_id = %id, enabled = updated.enabled, "Task updated");
        Ok(set.view(&updated))
    }

    pub async fn toggle_task(&self, id: &str) -> Result<ScheduledTask, TaskError> {
        let mut set = self.state.write().await;
        let mut task = set
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;

        task.enabled = !task.enabled;
        task.updated_at = Utc::now();
        if task.enabled {
            let job = self.job_for(&task);
            set.registry.register(&task, job)?;
        } else {
            set.registry.unregister(id);
        }

        set.tasks.insert(task.id.clone(), task.clone());
        self.persist(&set);

        info!(task_id = %id, enabled = task.enabled, "Task toggled");
        Ok(set.view(&task))
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), TaskError> {
        let mut set = self.state.write().await;
        if set.tasks.remove(id).is_none() {
            return Err(TaskError::NotFound(id.to_string()));
        }
        set.registry.unregister(id);
        self.persist(&set);
        self.executor.history().forget(id);

        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Fire `id` once, right now, with its current definition.
    pub async fn run_now(&self, id: &str) -> Result<FiringRecord, TaskError> {
        let fired_at = Utc::now();
        let task = stamp_last_executed(&self.state, self.store.as_ref(), id, fired_at)
            .await
            .ok_or_else(|| TaskError::NotFound(id.to_string()))?;
        info!(task_id = %id, "Manual run requested");
        Ok(fire_and_settle(&self.state, &self.executor, &task, fired_at).await)
    }

    /// Recent firings of `id`, newest first.
    pub async fn history(&self, id: &str) -> Result<Vec<FiringRecord>, TaskError> {
        if !self.state.read().await.tasks.contains_key(id) {
            return Err(TaskError::NotFound(id.to_string()));
        }
        Ok(self.executor.history().for_task(id))
    }

    /// Fire instants of every enabled task within the next `hours`, in time
    /// order.
    pub async fn preview(&self, hours: u32) -> Vec<UpcomingRun> {
        self.preview_from(Utc::now(), hours).await
    }

    pub async fn preview_from(&self, from: DateTime<Utc>, hours: u32) -> Vec<UpcomingRun> {
        let until = from + Duration::hours(i64::from(hours));
        let set = self.state.read().await;

        let mut runs: Vec<UpcomingRun> = set
            .tasks
            .values()
            .filter(|t| t.enabled)
            .filter_map(|t| match scheduler::parse(&t.cron_expression) {
                Ok(schedule) => Some((t, schedule)),
                Err(e) => {
                    warn!(task_id = %t.id, error = %e, "Stored task has an invalid schedule");
                    None
                }
            })
            .flat_map(|(t, schedule)| {
                schedule
                    .fires_between(from, until)
                    .into_iter()
                    .map(move |at| UpcomingRun {
                        task_id: t.id.clone(),
                        task_name: t.name.clone(),
                        at,
                    })
            })
            .collect();
        runs.sort_by(|a, b| a.at.cmp(&b.at).then_with(|| a.task_id.cmp(&b.task_id)));
        runs
    }

    /// Live registration handle of `id`, if it has one.
    pub async fn registration(&self, id: &str) -> Option<EntryId> {
        self.state.read().await.registry.handle(id)
    }

    /// Number of tasks with a live registration.
    pub async fn registered_count(&self) -> usize {
        self.state.read().await.registry.len()
    }

    pub async fn cron_engine(&self) -> Arc<dyn CronEngine> {
        self.state.read().await.registry.engine().clone()
    }
}

fn persist_tasks(store: &dyn TaskStore, set: &TaskSet) {
    let tasks: Vec<ScheduledTask> = set.tasks.values().cloned().collect();
    if let Err(e) = store.save_all(&tasks) {
        warn!(error = %e, "Failed to persist scheduled tasks");
    }
}

/// Record `fired_at` as the last execution of `task_id`, write the set to
/// disk and return the stamped definition. `None` when the task no longer
/// exists.
async fn stamp_last_executed(
    state: &RwLock<TaskSet>,
    store: &dyn TaskStore,
    task_id: &str,
    fired_at: DateTime<Utc>,
) -> Option<ScheduledTask> {
    let mut set = state.write().await;
    let task = set.tasks.get_mut(task_id)?;
    task.last_executed = Some(fired_at);
    let stamped = task.clone();
    persist_tasks(store, &set);
    Some(stamped)
}

/// Fire `task`. A task deleted while the firing was in flight leaves no
/// history behind.
async fn fire_and_settle(
    state: &RwLock<TaskSet>,
    executor: &ExecutionEngine,
    task: &ScheduledTask,
    fired_at: DateTime<Utc>,
) -> FiringRecord {
    let record = executor.fire(task, fired_at).await;
    if !state.read().await.tasks.contains_key(&task.id) {
        executor.history().forget(&task.id);
    }
    record
}

//! Task id → cron engine entry mapping.
//!
//! The registry is owned by the orchestrator's task set and mutated only
//! under its write lock, so the task map and the engine's entry table move
//! in lockstep.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::engine::CronEngine;
use super::{EntryId, Job, SchedulingError};
use crate::task::ScheduledTask;

pub struct SchedulerRegistry {
    engine: Arc<dyn CronEngine>,
    handles: HashMap<String, EntryId>,
}

impl SchedulerRegistry {
    pub fn new(engine: Arc<dyn CronEngine>) -> Self {
        Self {
            engine,
            handles: HashMap::new(),
        }
    }

    /// Install `job` for `task`. Any prior registration for the same id is
    /// torn down first, so old and new entries never coexist.
    pub fn register(&mut self, task: &ScheduledTask, job: Job) -> Result<EntryId, SchedulingError> {
        self.unregister(&task.id);
        let handle = self.engine.register(&task.cron_expression, job)?;
        self.handles.insert(task.id.clone(), handle);
        debug!(task_id = %task.id, entry = %handle, "task registered");
        Ok(handle)
    }

    /// Tear down the registration for `task_id`, if any.
    pub fn unregister(&mut self, task_id: &str) -> Option<EntryId> {
        let handle = self.handles.remove(task_id)?;
        self.engine.unregister(handle);
        debug!(task_id = %task_id, entry = %handle, "task unregistered");
        Some(handle)
    }

    /// Next fire instant of the task's live registration.
    pub fn next_fire_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.handles
            .get(task_id)
            .and_then(|handle| self.engine.next_fire_time(*handle))
    }

    pub fn handle(&self, task_id: &str) -> Option<EntryId> {
        self.handles.get(task_id).copied()
    }

    pub fn is_registered(&self, task_id: &str) -> bool {
        self.handles.contains_key(task_id)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn engine(&self) -> &Arc<dyn CronEngine> {
        &self.engine
    }
}

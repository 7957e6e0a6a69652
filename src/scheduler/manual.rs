//! Deterministic cron engine.
//!
//! Nothing fires on its own: time is a settable reference clock and entries
//! fire only when [`ManualCronEngine::fire`] is called. Used by tests and by
//! offline CLI commands that must not trigger snapshots.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::cron::{self, ParsedSchedule};
use super::engine::CronEngine;
use super::{EntryId, Job, SchedulingError};

struct State {
    entries: HashMap<EntryId, (ParsedSchedule, Job)>,
    last_id: u64,
    now: DateTime<Utc>,
    reject: bool,
    fail_next: u32,
}

pub struct ManualCronEngine {
    state: Mutex<State>,
}

impl Default for ManualCronEngine {
    fn default() -> Self {
        Self::at(Utc::now())
    }
}

impl ManualCronEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose reference clock starts at `now`.
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                last_id: 0,
                now,
                reject: false,
                fail_next: 0,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the reference clock.
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state().now = now;
    }

    /// Make every subsequent registration fail, simulating an engine fault.
    pub fn reject_registrations(&self, reject: bool) {
        self.state().reject = reject;
    }

    /// Fail only the next `count` registrations.
    pub fn fail_next_registrations(&self, count: u32) {
        self.state().fail_next = count;
    }

    /// Run one firing of `id` on its own task and wait for it to finish.
    /// Returns `false` when the handle is not live.
    pub async fn fire(&self, id: EntryId) -> bool {
        let job = {
            let state = self.state();
            match state.entries.get(&id) {
                Some((_, job)) => job.clone(),
                None => return false,
            }
        };
        if let Err(e) = tokio::spawn(job()).await {
            tracing::error!(entry = %id, error = %e, "manual firing panicked");
        }
        true
    }
}

impl CronEngine for ManualCronEngine {
    fn register(&self, expression: &str, job: Job) -> Result<EntryId, SchedulingError> {
        let mut state = self.state();
        if state.reject {
            return Err(SchedulingError::Unavailable(
                "registrations are being rejected".to_string(),
            ));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(SchedulingError::Unavailable(
                "injected registration failure".to_string(),
            ));
        }
        let schedule = cron::parse(expression)?;
        state.last_id += 1;
        let id = EntryId(state.last_id);
        state.entries.insert(id, (schedule, job));
        Ok(id)
    }

    fn unregister(&self, id: EntryId) {
        self.state().entries.remove(&id);
    }

    fn next_fire_time(&self, id: EntryId) -> Option<DateTime<Utc>> {
        let state = self.state();
        state
            .entries
            .get(&id)
            .and_then(|(schedule, _)| schedule.next_after(state.now))
    }

    fn contains(&self, id: EntryId) -> bool {
        self.state().entries.contains_key(&id)
    }

    fn len(&self) -> usize {
        self.state().entries.len()
    }
}

//! The shared cron timer engine.
//!
//! One background loop owns the timer for every registered entry. When an
//! entry comes due its job is handed to `tokio::spawn`, so a slow or stuck
//! firing never holds up the loop or delays other entries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cron::{self, ParsedSchedule};
use super::{EntryId, Job, SchedulingError};

/// Minimal interface over a cron engine. The orchestrator only ever needs to
/// install, remove and inspect entries, which keeps a deterministic engine
/// swappable in for tests.
pub trait CronEngine: Send + Sync {
    /// Install `job` to run every time `expression` fires.
    fn register(&self, expression: &str, job: Job) -> Result<EntryId, SchedulingError>;

    /// Remove an entry. Unknown handles are ignored.
    fn unregister(&self, id: EntryId);

    /// Next fire instant of a live entry.
    fn next_fire_time(&self, id: EntryId) -> Option<DateTime<Utc>>;

    /// Whether `id` refers to a live entry.
    fn contains(&self, id: EntryId) -> bool;

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    schedule: ParsedSchedule,
    next: Option<DateTime<Utc>>,
    job: Job,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<HashMap<EntryId, Entry>>,
    next_id: AtomicU64,
    wake: Notify,
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, HashMap<EntryId, Entry>> {
        // Entries are never left half-written, so a poisoned map is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cron engine driven by a single tokio timer loop.
///
/// Entries can be registered before [`TokioCronEngine::start`]; they simply
/// do not fire until the loop is running.
#[derive(Clone, Default)]
pub struct TokioCronEngine {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl TokioCronEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn the timer loop. Call once per process.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            run_timer_loop(inner, shutdown).await;
        })
    }

    /// Stop the timer loop. Firings already spawned run to completion.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl CronEngine for TokioCronEngine {
    fn register(&self, expression: &str, job: Job) -> Result<EntryId, SchedulingError> {
        let schedule = cron::parse(expression)?;
        let next = schedule.next_after(Utc::now());
        let id = EntryId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);

        self.inner.entries().insert(id, Entry { schedule, next, job });
        self.inner.wake.notify_one();
        debug!(entry = %id, %expression, ?next, "cron entry registered");
        Ok(id)
    }

    fn unregister(&self, id: EntryId) {
        if self.inner.entries().remove(&id).is_some() {
            self.inner.wake.notify_one();
            debug!(entry = %id, "cron entry removed");
        }
    }

    fn next_fire_time(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.inner.entries().get(&id).and_then(|e| e.next)
    }

    fn contains(&self, id: EntryId) -> bool {
        self.inner.entries().contains_key(&id)
    }

    fn len(&self) -> usize {
        self.inner.entries().len()
    }
}

/// Main timer loop.
/// Sleeps until the earliest due entry, spawns every due job, advances those
/// entries to their next instant, and repeats. Registration changes wake the
/// loop early so a new, sooner entry is never missed.
async fn run_timer_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    info!("Cron engine started");

    loop {
        let now = Utc::now();
        let (due, wake_at) = collect_due(&inner, now);

        for (id, job) in due {
            debug!(entry = %id, "cron entry fired");
            tokio::spawn(job());
        }

        let sleep_for = match wake_at {
            Some(at) => (at - now).to_std().unwrap_or_default(),
            // Nothing scheduled; wait for a registration.
            None => std::time::Duration::from_secs(3600),
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    info!("Cron engine stopped");
}

fn collect_due(inner: &Inner, now: DateTime<Utc>) -> (Vec<(EntryId, Job)>, Option<DateTime<Utc>>) {
    let mut entries = inner.entries();
    let mut due = Vec::new();
    let mut wake_at: Option<DateTime<Utc>> = None;

    for (id, entry) in entries.iter_mut() {
        if let Some(next) = entry.next {
            if next <= now {
                due.push((*id, entry.job.clone()));
                entry.next = entry.schedule.next_after(now);
                if entry.next.is_none() {
                    warn!(entry = %id, expression = %entry.schedule, "cron entry has no further fire times");
                }
            }
        }
        if let Some(next) = entry.next {
            wake_at = Some(wake_at.map_or(next, |w| w.min(next)));
        }
    }

    (due, wake_at)
}

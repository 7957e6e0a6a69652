//! Cron scheduling: expression validation, the shared timer engine, and the
//! registry that maps task ids to live engine entries.

pub mod cron;
pub mod engine;
pub mod history;
pub mod manual;
pub mod registry;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

// Re-export common types
pub use self::cron::{parse, InvalidScheduleError, ParsedSchedule};
pub use self::engine::{CronEngine, TokioCronEngine};
pub use self::manual::ManualCronEngine;
pub use self::registry::SchedulerRegistry;

/// Opaque handle identifying one live engine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Work run on every fire of an entry. Each call yields a fresh future that
/// the engine spawns on its own task.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum SchedulingError {
    #[error("cron engine rejected schedule: {0}")]
    InvalidSchedule(#[from] InvalidScheduleError),

    #[error("cron engine unavailable: {0}")]
    Unavailable(String),
}

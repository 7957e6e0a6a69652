//! Task persistence -- a single indented JSON document holding every task.
//!
//! The in-memory task map is the system of record while the process runs;
//! the file is its mirror, rewritten in full after every mutation and read
//! once at start-up.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::task::ScheduledTask;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create data directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to serialize tasks: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write task file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Durable key-value persistence of task definitions.
pub trait TaskStore: Send + Sync {
    /// Read every persisted task. A missing or unreadable document yields an
    /// empty collection; start-up never fails on bad data.
    fn load(&self) -> Vec<ScheduledTask>;

    /// Replace the persisted document with `tasks`.
    fn save_all(&self, tasks: &[ScheduledTask]) -> Result<(), StoreError>;
}

/// File-backed store. Writes go to a sibling temp file which is then renamed
/// over the target, so a crash mid-write leaves the previous document intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tasks.json".into());
        name.push(format!(".tmp.{}", std::process::id()));
        self.path.with_file_name(name)
    }
}

impl TaskStore for JsonFileStore {
    fn load(&self) -> Vec<ScheduledTask> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %self.path.display(), "Task file not found, starting with no tasks");
                return Vec::new();
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to read task file");
                return Vec::new();
            }
        };

        match serde_json::from_slice::<Option<Vec<ScheduledTask>>>(&data) {
            Ok(tasks) => {
                let mut tasks = tasks.unwrap_or_default();
                for task in &mut tasks {
                    task.next_execution = None;
                }
                info!(path = %self.path.display(), count = tasks.len(), "Loaded scheduled tasks");
                tasks
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to parse task file");
                Vec::new()
            }
        }
    }

    fn save_all(&self, tasks: &[ScheduledTask]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let mut ordered: Vec<ScheduledTask> = tasks
            .iter()
            .cloned()
            .map(|mut t| {
                t.next_execution = None;
                t
            })
            .collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let json = serde_json::to_vec_pretty(&ordered)?;
        let tmp = self.temp_path();
        let write_err = |source| StoreError::Write {
            path: self.path.clone(),
            source,
        };

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        debug!(path = %self.path.display(), count = ordered.len(), "Task file written");
        Ok(())
    }
}

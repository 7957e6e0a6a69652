//! In-memory clusters.
//!
//! Volumes and snapshots live in process memory. Useful for local dry runs
//! and for exercising the execution engine without a Kubernetes API.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Notify};

use super::{ClusterClient, ClusterError, ClusterRegistry, CreatedSnapshot, VolumeInfo};
use crate::task::SnapshotSpec;

#[derive(Default)]
struct ClusterState {
    volumes: HashMap<String, BTreeSet<String>>,
    snapshots: Vec<SnapshotSpec>,
    failure: Option<String>,
}

/// One in-memory cluster.
pub struct MemoryCluster {
    name: String,
    state: Mutex<ClusterState>,
    held: watch::Sender<bool>,
    listing_started: Notify,
}

impl MemoryCluster {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(ClusterState::default()),
            held: watch::channel(false).0,
            listing_started: Notify::new(),
        }
    }

    /// Builder-style volume registration.
    pub fn with_volume(self, namespace: &str, volume: &str) -> Self {
        self.add_volume(namespace, volume);
        self
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_volume(&self, namespace: &str, volume: &str) {
        self.state()
            .volumes
            .entry(namespace.to_string())
            .or_default()
            .insert(volume.to_string());
    }

    pub fn remove_volume(&self, namespace: &str, volume: &str) {
        if let Some(volumes) = self.state().volumes.get_mut(namespace) {
            volumes.remove(volume);
        }
    }

    /// Make every request fail with `message` until cleared with `None`.
    pub fn fail_requests(&self, message: Option<&str>) {
        self.state().failure = message.map(str::to_string);
    }

    /// Park every `list_volumes` call until [`release_listings`](Self::release_listings).
    pub fn hold_listings(&self) {
        self.held.send_replace(true);
    }

    pub fn release_listings(&self) {
        self.held.send_replace(false);
    }

    /// Resolves once a `list_volumes` call has begun, even one that began
    /// before this was awaited.
    pub async fn listing_started(&self) {
        self.listing_started.notified().await;
    }

    /// Snapshots created so far, in creation order.
    pub fn snapshots(&self) -> Vec<SnapshotSpec> {
        self.state().snapshots.clone()
    }

    fn check_failure(&self, state: &ClusterState) -> Result<(), ClusterError> {
        match &state.failure {
            Some(message) => Err(ClusterError::Request {
                cluster: self.name.clone(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeInfo>, ClusterError> {
        self.listing_started.notify_one();
        let mut held = self.held.subscribe();
        let _ = held.wait_for(|held| !*held).await;

        let state = self.state();
        self.check_failure(&state)?;
        Ok(state
            .volumes
            .get(namespace)
            .map(|volumes| {
                volumes
                    .iter()
                    .map(|name| VolumeInfo {
                        name: name.clone(),
                        namespace: namespace.to_string(),
                        phase: Some("Bound".to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_snapshot(
        &self,
        namespace: &str,
        spec: &SnapshotSpec,
    ) -> Result<CreatedSnapshot, ClusterError> {
        let mut state = self.state();
        self.check_failure(&state)?;
        if state
            .snapshots
            .iter()
            .any(|s| s.namespace == namespace && s.name == spec.name)
        {
            return Err(ClusterError::Request {
                cluster: self.name.clone(),
                message: format!("volumesnapshot {}/{} already exists", namespace, spec.name),
            });
        }
        state.snapshots.push(spec.clone());
        Ok(CreatedSnapshot {
            name: spec.name.clone(),
            namespace: namespace.to_string(),
            uid: None,
        })
    }
}

enum Slot {
    Online(Arc<MemoryCluster>),
    Disabled,
    Unavailable,
}

struct RegistryState {
    current: String,
    slots: HashMap<String, Slot>,
}

/// Registry over in-memory clusters.
pub struct MemoryClusters {
    multi_cluster: bool,
    state: Mutex<RegistryState>,
}

impl MemoryClusters {
    /// Multi-cluster capable registry whose current cluster is `current`.
    pub fn new(current: &str) -> Self {
        Self {
            multi_cluster: true,
            state: Mutex::new(RegistryState {
                current: current.to_string(),
                slots: HashMap::new(),
            }),
        }
    }

    /// Registry that can only route to the current cluster.
    pub fn single_cluster(current: &str) -> Self {
        Self {
            multi_cluster: false,
            ..Self::new(current)
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_cluster(self, cluster: Arc<MemoryCluster>) -> Self {
        self.insert(cluster);
        self
    }

    pub fn insert(&self, cluster: Arc<MemoryCluster>) {
        self.state()
            .slots
            .insert(cluster.name().to_string(), Slot::Online(cluster));
    }

    pub fn disable(&self, name: &str) {
        self.state().slots.insert(name.to_string(), Slot::Disabled);
    }

    pub fn mark_unavailable(&self, name: &str) {
        self.state().slots.insert(name.to_string(), Slot::Unavailable);
    }
}

impl ClusterRegistry for MemoryClusters {
    fn current_cluster_name(&self) -> String {
        self.state().current.clone()
    }

    fn supports_multi_cluster(&self) -> bool {
        self.multi_cluster
    }

    fn client_for(&self, name: &str) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        match self.state().slots.get(name) {
            Some(Slot::Online(cluster)) => Ok(cluster.clone()),
            Some(Slot::Disabled) => Err(ClusterError::Disabled(name.to_string())),
            Some(Slot::Unavailable) => Err(ClusterError::Unavailable(name.to_string())),
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }
}

//! Cluster collaborators: the per-cluster API client and the registry that
//! resolves cluster names to clients.

pub mod kube;
pub mod memory;
pub mod registry;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::SnapshotSpec;

pub use self::kube::KubeClient;
pub use self::memory::{MemoryCluster, MemoryClusters};
pub use self::registry::ConfiguredClusters;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster {0} not found")]
    NotFound(String),

    #[error("cluster {0} is disabled")]
    Disabled(String),

    #[error("cluster {0} is not available")]
    Unavailable(String),

    #[error("request to cluster {cluster} failed: {message}")]
    Request { cluster: String, message: String },

    #[error("unexpected response from cluster {cluster}: {message}")]
    Decode { cluster: String, message: String },
}

/// A persistent volume claim, as far as precondition checks are concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// A snapshot the cluster accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSnapshot {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

/// Connection state of a configured cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Online,
    Error,
    Disabled,
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterStatus::Online => write!(f, "online"),
            ClusterStatus::Error => write!(f, "error"),
            ClusterStatus::Disabled => write!(f, "disabled"),
        }
    }
}

/// Display view of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterInfo {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    pub status: ClusterStatus,
}

/// Snapshot and volume operations against one cluster. Implementations carry
/// their own network-level timeouts.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// List volume claims in `namespace`.
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeInfo>, ClusterError>;

    /// Submit a snapshot-creation request.
    async fn create_snapshot(
        &self,
        namespace: &str,
        spec: &SnapshotSpec,
    ) -> Result<CreatedSnapshot, ClusterError>;
}

/// Resolves cluster names to usable clients.
pub trait ClusterRegistry: Send + Sync {
    /// Name of the cluster that is current right now.
    fn current_cluster_name(&self) -> String;

    /// Whether work can be routed to clusters other than the current one.
    fn supports_multi_cluster(&self) -> bool;

    /// Client for `name`, or why it cannot be used.
    fn client_for(&self, name: &str) -> Result<Arc<dyn ClusterClient>, ClusterError>;
}

//! One unit of work: existence check then snapshot creation on one cluster.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::cluster::{ClusterError, ClusterRegistry, CreatedSnapshot};
use crate::task::SnapshotSpec;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("source volume {namespace}/{volume} not found on cluster {cluster}")]
    PreconditionFailed {
        volume: String,
        namespace: String,
        cluster: String,
    },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("unit of work did not complete: {0}")]
    Interrupted(String),
}

/// Create the snapshot described by `spec` on `cluster`, provided its source
/// volume exists there. Failures are logged here, at the point they occur.
pub async fn snapshot_on(
    clusters: &dyn ClusterRegistry,
    cluster: &str,
    spec: &SnapshotSpec,
) -> Result<CreatedSnapshot, TargetError> {
    let result = attempt(clusters, cluster, spec).await;
    match &result {
        Ok(created) => {
            debug!(cluster = %cluster, snapshot = %created.name, "Snapshot created");
        }
        Err(e @ TargetError::PreconditionFailed { .. }) => {
            warn!(cluster = %cluster, snapshot = %spec.name, error = %e, "Precondition failed, skipping target");
        }
        Err(e) => {
            error!(cluster = %cluster, snapshot = %spec.name, error = %e, "Snapshot creation failed");
        }
    }
    result
}

async fn attempt(
    clusters: &dyn ClusterRegistry,
    cluster: &str,
    spec: &SnapshotSpec,
) -> Result<CreatedSnapshot, TargetError> {
    let client = clusters.client_for(cluster)?;

    let volumes = client.list_volumes(&spec.namespace).await?;
    if !volumes.iter().any(|v| v.name == spec.source_volume_name) {
        return Err(TargetError::PreconditionFailed {
            volume: spec.source_volume_name.clone(),
            namespace: spec.namespace.clone(),
            cluster: cluster.to_string(),
        });
    }

    Ok(client.create_snapshot(&spec.namespace, spec).await?)
}

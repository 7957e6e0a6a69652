//! Kubernetes API client for volume claims and CSI volume snapshots.
//!
//! Talks plain REST to the API server with a bearer token; only the two
//! calls the execution engine needs are implemented.

use std::time::Duration;

use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{ClusterClient, ClusterError, CreatedSnapshot, VolumeInfo};
use crate::task::SnapshotSpec;

const SNAPSHOT_API: &str = "snapshot.storage.k8s.io/v1";

/// Connection settings for one API server.
#[derive(Debug, Clone)]
pub struct KubeEndpoint {
    pub cluster: String,
    pub server: String,
    pub token: Option<String>,
    pub ca_pem: Option<String>,
    pub insecure: bool,
    pub timeout: Duration,
}

pub struct KubeClient {
    cluster: String,
    server: String,
    token: Option<String>,
    http: Client,
}

#[derive(Deserialize)]
struct ObjectList {
    #[serde(default)]
    items: Vec<Object>,
}

#[derive(Deserialize)]
struct Object {
    metadata: Metadata,
    #[serde(default)]
    status: Option<ClaimStatus>,
}

#[derive(Deserialize)]
struct Metadata {
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Deserialize)]
struct ClaimStatus {
    #[serde(default)]
    phase: Option<String>,
}

impl KubeClient {
    pub fn new(endpoint: KubeEndpoint) -> Result<Self, ClusterError> {
        let build_err = |message: String| ClusterError::Request {
            cluster: endpoint.cluster.clone(),
            message,
        };

        let mut builder = Client::builder().timeout(endpoint.timeout);
        if let Some(pem) = &endpoint.ca_pem {
            let cert = Certificate::from_pem(pem.as_bytes())
                .map_err(|e| build_err(format!("invalid certificate authority data: {e}")))?;
            builder = builder.add_root_certificate(cert);
        } else if endpoint.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| build_err(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            cluster: endpoint.cluster,
            server: endpoint.server.trim_end_matches('/').to_string(),
            token: endpoint.token,
            http,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.server, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn request_error(&self, e: reqwest::Error) -> ClusterError {
        ClusterError::Request {
            cluster: self.cluster.clone(),
            message: e.to_string(),
        }
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, ClusterError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);
        Err(match status {
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => {
                ClusterError::Unavailable(self.cluster.clone())
            }
            _ => ClusterError::Request {
                cluster: self.cluster.clone(),
                message: format!("{status}: {message}"),
            },
        })
    }
}

/// VolumeSnapshot manifest for `spec`.
pub fn volume_snapshot_manifest(spec: &SnapshotSpec) -> Value {
    json!({
        "apiVersion": SNAPSHOT_API,
        "kind": "VolumeSnapshot",
        "metadata": {
            "name": spec.name,
            "namespace": spec.namespace,
            "labels": spec.labels,
            "annotations": spec.annotations,
        },
        "spec": {
            "volumeSnapshotClassName": spec.snapshot_class_name,
            "source": {
                "persistentVolumeClaimName": spec.source_volume_name,
            },
        },
    })
}

#[async_trait::async_trait]
impl ClusterClient for KubeClient {
    async fn list_volumes(&self, namespace: &str) -> Result<Vec<VolumeInfo>, ClusterError> {
        let path = format!("/api/v1/namespaces/{namespace}/persistentvolumeclaims");
        let resp = self
            .request(reqwest::Method::GET, &path)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let list: ObjectList = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClusterError::Decode {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })?;

        debug!(cluster = %self.cluster, %namespace, count = list.items.len(), "listed volume claims");
        Ok(list
            .items
            .into_iter()
            .map(|o| VolumeInfo {
                name: o.metadata.name,
                namespace: o.metadata.namespace.unwrap_or_else(|| namespace.to_string()),
                phase: o.status.and_then(|s| s.phase),
            })
            .collect())
    }

    async fn create_snapshot(
        &self,
        namespace: &str,
        spec: &SnapshotSpec,
    ) -> Result<CreatedSnapshot, ClusterError> {
        let path = format!("/apis/{SNAPSHOT_API}/namespaces/{namespace}/volumesnapshots");
        let resp = self
            .request(reqwest::Method::POST, &path)
            .json(&volume_snapshot_manifest(spec))
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let created: Object = self
            .check(resp)
            .await?
            .json()
            .await
            .map_err(|e| ClusterError::Decode {
                cluster: self.cluster.clone(),
                message: e.to_string(),
            })?;

        Ok(CreatedSnapshot {
            name: created.metadata.name,
            namespace: created
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string()),
            uid: created.metadata.uid,
        })
    }
}

//! Cluster registry backed by the `[clusters]` config section.
//!
//! One [`KubeClient`] is built per enabled entry at start-up. An entry whose
//! client cannot be built stays listed with [`ClusterStatus::Error`] and
//! resolves to [`ClusterError::Unavailable`]. With no entries configured, the
//! process assumes it runs inside a pod and talks to its own API server.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::kube::{KubeClient, KubeEndpoint};
use super::{ClusterClient, ClusterError, ClusterInfo, ClusterRegistry, ClusterStatus};
use crate::config::{ClusterEntry, ClustersConfig};

/// Name given to the implicit in-cluster entry.
pub const IN_CLUSTER_NAME: &str = "default";

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// API server coordinates discovered from the pod environment.
#[derive(Debug, Clone)]
pub struct InClusterEnv {
    pub host: String,
    pub port: String,
    pub token: Option<String>,
    pub ca_pem: Option<String>,
}

impl InClusterEnv {
    /// Read `KUBERNETES_SERVICE_HOST`/`_PORT` and the mounted service-account
    /// credentials. `None` outside a pod.
    pub fn detect() -> Option<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").ok()?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        Some(Self {
            host,
            port,
            token: read_trimmed(&dir.join("token")),
            ca_pem: std::fs::read_to_string(dir.join("ca.crt")).ok(),
        })
    }

    fn server(&self) -> String {
        if self.host.contains(':') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(s) => Some(s.trim().to_string()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to read token file");
            None
        }
    }
}

enum Slot {
    Online(Arc<KubeClient>),
    Failed(String),
    Disabled,
}

struct Member {
    entry: ClusterEntry,
    slot: Slot,
}

/// Registry over the configured Kubernetes API servers.
pub struct ConfiguredClusters {
    multi_cluster: bool,
    members: BTreeMap<String, Member>,
    current: RwLock<String>,
}

impl ConfiguredClusters {
    pub fn from_config(config: &ClustersConfig) -> Self {
        Self::build(config, InClusterEnv::detect())
    }

    /// Build from `config`, using `in_cluster` when no entries are configured.
    pub fn build(config: &ClustersConfig, in_cluster: Option<InClusterEnv>) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let mut members = BTreeMap::new();
        let mut order = Vec::new();

        if config.entries.is_empty() {
            let (entry, slot) = in_cluster_member(in_cluster, timeout);
            order.push(entry.name.clone());
            members.insert(entry.name.clone(), Member { entry, slot });
        }

        for entry in &config.entries {
            if entry.name.is_empty() {
                warn!("skipping cluster entry without a name");
                continue;
            }
            if members.contains_key(&entry.name) {
                warn!(cluster = %entry.name, "duplicate cluster entry ignored");
                continue;
            }
            let slot = connect(entry, timeout);
            order.push(entry.name.clone());
            members.insert(entry.name.clone(), Member { entry: entry.clone(), slot });
        }

        let current = config
            .default_cluster
            .clone()
            .or_else(|| {
                order
                    .iter()
                    .find(|name| members.get(*name).is_some_and(|m| m.entry.enabled))
                    .cloned()
            })
            .or_else(|| order.first().cloned())
            .unwrap_or_else(|| IN_CLUSTER_NAME.to_string());

        info!(
            clusters = members.len(),
            current = %current,
            multi_cluster = config.multi_cluster,
            "cluster registry ready"
        );

        Self {
            multi_cluster: config.multi_cluster,
            members,
            current: RwLock::new(current),
        }
    }

    /// Make `name` the current cluster. Only online clusters qualify.
    pub fn switch_cluster(&self, name: &str) -> Result<(), ClusterError> {
        self.resolve(name)?;
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        info!(from = %current, to = %name, "switched current cluster");
        *current = name.to_string();
        Ok(())
    }

    /// Every configured cluster, sorted by name.
    pub fn clusters(&self) -> Vec<ClusterInfo> {
        self.members
            .iter()
            .map(|(name, member)| ClusterInfo {
                name: name.clone(),
                display_name: if member.entry.display_name.is_empty() {
                    name.clone()
                } else {
                    member.entry.display_name.clone()
                },
                description: member.entry.description.clone(),
                enabled: member.entry.enabled,
                status: match member.slot {
                    Slot::Online(_) => ClusterStatus::Online,
                    Slot::Failed(_) => ClusterStatus::Error,
                    Slot::Disabled => ClusterStatus::Disabled,
                },
            })
            .collect()
    }

    fn resolve(&self, name: &str) -> Result<Arc<KubeClient>, ClusterError> {
        match self.members.get(name).map(|m| &m.slot) {
            Some(Slot::Online(client)) => Ok(client.clone()),
            Some(Slot::Failed(reason)) => {
                debug!(cluster = %name, %reason, "cluster client unavailable");
                Err(ClusterError::Unavailable(name.to_string()))
            }
            Some(Slot::Disabled) => Err(ClusterError::Disabled(name.to_string())),
            None => Err(ClusterError::NotFound(name.to_string())),
        }
    }
}

fn connect(entry: &ClusterEntry, timeout: Duration) -> Slot {
    if !entry.enabled {
        return Slot::Disabled;
    }
    if entry.server.is_empty() {
        warn!(cluster = %entry.name, "cluster entry has no server URL");
        return Slot::Failed("no server URL configured".to_string());
    }
    let token = entry
        .token
        .clone()
        .or_else(|| entry.token_file.as_deref().and_then(read_trimmed));
    let endpoint = KubeEndpoint {
        cluster: entry.name.clone(),
        server: entry.server.clone(),
        token,
        ca_pem: entry.certificate_authority_data.clone(),
        insecure: entry.insecure_skip_tls_verify,
        timeout,
    };
    match KubeClient::new(endpoint) {
        Ok(client) => Slot::Online(Arc::new(client)),
        Err(e) => {
            warn!(cluster = %entry.name, error = %e, "failed to initialise cluster client");
            Slot::Failed(e.to_string())
        }
    }
}

fn in_cluster_member(env: Option<InClusterEnv>, timeout: Duration) -> (ClusterEntry, Slot) {
    let mut entry = ClusterEntry {
        name: IN_CLUSTER_NAME.to_string(),
        display_name: "In-cluster".to_string(),
        description: "API server of the pod this process runs in".to_string(),
        ..Default::default()
    };
    let Some(env) = env else {
        warn!("no clusters configured and not running inside a pod");
        return (entry, Slot::Failed("not running inside a cluster".to_string()));
    };
    entry.server = env.server();
    entry.token = env.token;
    entry.certificate_authority_data = env.ca_pem;
    let slot = connect(&entry, timeout);
    (entry, slot)
}

impl ClusterRegistry for ConfiguredClusters {
    fn current_cluster_name(&self) -> String {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn supports_multi_cluster(&self) -> bool {
        self.multi_cluster
    }

    fn client_for(&self, name: &str) -> Result<Arc<dyn ClusterClient>, ClusterError> {
        let client: Arc<dyn ClusterClient> = self.resolve(name)?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, server: &str, enabled: bool) -> ClusterEntry {
        ClusterEntry {
            name: name.to_string(),
            server: server.to_string(),
            enabled,
            insecure_skip_tls_verify: true,
            ..Default::default()
        }
    }

    fn config(entries: Vec<ClusterEntry>) -> ClustersConfig {
        ClustersConfig {
            entries,
            ..Default::default()
        }
    }

    #[test]
    fn test_statuses_reflect_entries() {
        let clusters = ConfiguredClusters::build(
            &config(vec![
                entry("east", "https://10.0.0.1:6443", true),
                entry("west", "https://10.0.0.2:6443", false),
                entry("north", "", true),
            ]),
            None,
        );

        let infos = clusters.clusters();
        let status = |name: &str| infos.iter().find(|c| c.name == name).unwrap().status;
        assert_eq!(status("east"), ClusterStatus::Online);
        assert_eq!(status("west"), ClusterStatus::Disabled);
        assert_eq!(status("north"), ClusterStatus::Error);
        assert_eq!(infos[0].display_name, "east");
    }

    #[test]
    fn test_client_resolution_errors() {
        let clusters = ConfiguredClusters::build(
            &config(vec![
                entry("east", "https://10.0.0.1:6443", true),
                entry("west", "https://10.0.0.2:6443", false),
                entry("north", "", true),
            ]),
            None,
        );

        assert!(clusters.client_for("east").is_ok());
        assert!(matches!(clusters.client_for("west"), Err(ClusterError::Disabled(_))));
        assert!(matches!(clusters.client_for("north"), Err(ClusterError::Unavailable(_))));
        assert!(matches!(clusters.client_for("south"), Err(ClusterError::NotFound(_))));
    }

    #[test]
    fn test_current_defaults_to_first_enabled_entry() {
        let clusters = ConfiguredClusters::build(
            &config(vec![
                entry("west", "https://10.0.0.2:6443", false),
                entry("east", "https://10.0.0.1:6443", true),
            ]),
            None,
        );
        assert_eq!(clusters.current_cluster_name(), "east");
    }

    #[test]
    fn test_switch_cluster() {
        let clusters = ConfiguredClusters::build(
            &config(vec![
                entry("east", "https://10.0.0.1:6443", true),
                entry("west", "https://10.0.0.2:6443", true),
                entry("old", "https://10.0.0.3:6443", false),
            ]),
            None,
        );
        clusters.switch_cluster("west").unwrap();
        assert_eq!(clusters.current_cluster_name(), "west");

        assert!(clusters.switch_cluster("old").is_err());
        assert!(clusters.switch_cluster("missing").is_err());
        assert_eq!(clusters.current_cluster_name(), "west");
    }

    #[test]
    fn test_in_cluster_default() {
        let env = InClusterEnv {
            host: "10.96.0.1".to_string(),
            port: "443".to_string(),
            token: Some("sa-token".to_string()),
            ca_pem: None,
        };
        let clusters = ConfiguredClusters::build(&config(Vec::new()), Some(env));
        assert_eq!(clusters.current_cluster_name(), IN_CLUSTER_NAME);
        assert_eq!(clusters.clusters()[0].status, ClusterStatus::Online);
        assert!(clusters.client_for(IN_CLUSTER_NAME).is_ok());
    }

    #[test]
    fn test_no_entries_outside_pod() {
        let clusters = ConfiguredClusters::build(&config(Vec::new()), None);
        assert_eq!(clusters.clusters().len(), 1);
        assert_eq!(clusters.clusters()[0].status, ClusterStatus::Error);
        assert!(matches!(
            clusters.client_for(IN_CLUSTER_NAME),
            Err(ClusterError::Unavailable(_))
        ));
    }

    #[test]
    fn test_ipv6_server_url() {
        let env = InClusterEnv {
            host: "fd00::1".to_string(),
            port: "6443".to_string(),
            token: None,
            ca_pem: None,
        };
        assert_eq!(env.server(), "https://[fd00::1]:6443");
    }
}

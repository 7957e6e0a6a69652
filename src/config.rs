//! TOML configuration.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid. The file is located via `--config`, then the `SNAPCADENCE_CONFIG`
//! environment variable, then `/etc/snapcadence/snapcadence.toml`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "SNAPCADENCE_CONFIG";

/// Standard system location of the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/snapcadence/snapcadence.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the snapcadence process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub clusters: ClustersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration:
    /// 1. `explicit` (from the command line) -- errors are fatal.
    /// 2. The path in `SNAPCADENCE_CONFIG`.
    /// 3. [`SYSTEM_CONFIG_PATH`].
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "SNAPCADENCE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Task file location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON document holding every scheduled task.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/scheduled_tasks.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// What to do with a task that names target clusters when the cluster
/// registry cannot route to anything but the current cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiClusterPolicy {
    /// Run against the current cluster only and log the degradation.
    #[default]
    Fallback,
    /// Refuse such tasks at create/update time and skip such firings.
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub multi_cluster_policy: MultiClusterPolicy,
    /// Firings remembered per task.
    pub history_limit: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            multi_cluster_policy: MultiClusterPolicy::Fallback,
            history_limit: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Clusters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClustersConfig {
    /// Cluster that is current at start-up. Defaults to the first enabled entry.
    pub default_cluster: Option<String>,
    /// Allow routing firings to clusters other than the current one.
    pub multi_cluster: bool,
    /// Per-request timeout for cluster API calls.
    pub timeout_secs: u64,
    pub entries: Vec<ClusterEntry>,
}

impl Default for ClustersConfig {
    fn default() -> Self {
        Self {
            default_cluster: None,
            multi_cluster: true,
            timeout_secs: 30,
            entries: Vec::new(),
        }
    }
}

/// One Kubernetes API server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterEntry {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    /// API server URL, e.g. `https://10.0.0.1:6443`.
    pub server: String,
    pub token: Option<String>,
    /// File containing the bearer token; read at start-up.
    pub token_file: Option<PathBuf>,
    /// PEM bundle used to verify the API server.
    pub certificate_authority_data: Option<String>,
    pub insecure_skip_tls_verify: bool,
}

impl Default for ClusterEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: String::new(),
            description: String::new(),
            enabled: true,
            server: String::new(),
            token: None,
            token_file: None,
            certificate_authority_data: None,
            insecure_skip_tls_verify: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

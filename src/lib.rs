//! snapcadence -- scheduled volume snapshots across Kubernetes clusters.
//!
//! This crate provides the task model and store, the cron scheduler, the
//! execution engine that fans snapshots out to target clusters, and the
//! orchestrator facade that keeps them consistent.

pub mod cluster;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod scheduler;
pub mod storage;
pub mod task;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cluster::{ClusterRegistry, ConfiguredClusters};
use crate::config::AppConfig;
use crate::orchestrator::{Orchestrator, OrchestratorOptions};
use crate::scheduler::{CronEngine, TokioCronEngine};
use crate::storage::JsonFileStore;

/// Build an orchestrator over the configured task file, restoring persisted
/// tasks into `engine`.
pub async fn open_orchestrator(
    config: &AppConfig,
    engine: Arc<dyn CronEngine>,
    clusters: Arc<dyn ClusterRegistry>,
) -> Orchestrator {
    let store = Arc::new(JsonFileStore::new(config.store.path.clone()));
    let options = OrchestratorOptions {
        policy: config.scheduler.multi_cluster_policy,
        history_limit: config.scheduler.history_limit,
    };
    Orchestrator::start(store, engine, clusters, options).await
}

/// Start the snapcadence daemon: restore tasks, run the cron engine until
/// Ctrl-C, then stop it.
pub async fn serve(config: AppConfig) -> Result<()> {
    tracing::info!(store = %config.store.path.display(), "Initializing task store");

    let engine = TokioCronEngine::new();
    let clusters = Arc::new(ConfiguredClusters::from_config(&config.clusters));
    let orchestrator = open_orchestrator(&config, Arc::new(engine.clone()), clusters).await;

    let timer = engine.start();
    tracing::info!(
        tasks = orchestrator.list_tasks().await.len(),
        registered = orchestrator.registered_count().await,
        "snapcadence running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutdown requested, stopping cron engine");

    engine.shutdown();
    timer.await.context("cron engine task panicked")?;
    drop(orchestrator);

    Ok(())
}

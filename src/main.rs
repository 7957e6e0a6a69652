use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use snapcadence::cluster::{ClusterRegistry, ConfiguredClusters};
use snapcadence::config::{AppConfig, LoggingConfig};
use snapcadence::orchestrator::Orchestrator;
use snapcadence::scheduler::{self, ManualCronEngine};
use snapcadence::task::{ScheduledTask, TaskDefinition};

#[derive(Parser)]
#[command(
    name = "snapcadence",
    about = "Scheduled volume snapshots across Kubernetes clusters",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (cron engine + snapshot execution)
    Serve,

    /// Manage scheduled snapshot tasks in the task file
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },

    /// Cron expression tools
    Cron {
        #[command(subcommand)]
        action: CronAction,
    },

    /// Inspect configured clusters
    Clusters {
        #[command(subcommand)]
        action: ClustersAction,
    },
}

#[derive(Subcommand)]
enum TaskAction {
    /// List all tasks
    List {
        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Show one task and its recent status
    Show {
        #[arg(long)]
        id: String,
    },

    /// Add a new task
    Add {
        #[arg(long)]
        name: String,

        #[arg(long)]
        namespace: String,

        /// Source persistent volume claim
        #[arg(long)]
        volume: String,

        /// Volume snapshot class
        #[arg(long = "class")]
        snapshot_class: String,

        /// Cron expression (6-field, seconds first)
        #[arg(long)]
        cron: String,

        /// Target cluster; repeat for several. Omit to use the current cluster.
        #[arg(long = "target")]
        targets: Vec<String>,

        /// Recorded as the task's creator; defaults to $USER
        #[arg(long)]
        created_by: Option<String>,
    },

    /// Change fields of an existing task
    Update {
        #[arg(long)]
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        namespace: Option<String>,

        #[arg(long)]
        volume: Option<String>,

        #[arg(long = "class")]
        snapshot_class: Option<String>,

        #[arg(long)]
        cron: Option<String>,

        /// Replace the target cluster list
        #[arg(long = "target")]
        targets: Option<Vec<String>>,

        /// Clear the target cluster list
        #[arg(long, conflicts_with = "targets")]
        clear_targets: bool,

        #[arg(long)]
        enabled: Option<bool>,
    },

    /// Enable a disabled task, or disable an enabled one
    Toggle {
        #[arg(long)]
        id: String,
    },

    /// Remove a task
    Remove {
        #[arg(long)]
        id: String,
    },

    /// Fire a task once, now
    Run {
        #[arg(long)]
        id: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u32,
    },
}

#[derive(Subcommand)]
enum CronAction {
    /// Validate an expression and print its next fire times
    Check {
        expression: String,

        #[arg(long, default_value = "5")]
        count: usize,
    },
}

#[derive(Subcommand)]
enum ClustersAction {
    /// List configured clusters and their status
    List,
}

/// Subscriber for what gets logged while the config itself is being read.
fn bootstrap_tracing() -> tracing::subscriber::DefaultGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_default(subscriber)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Orchestrator over the task file. Nothing fires on its own while the
/// command runs.
async fn offline_orchestrator(config: &AppConfig) -> Orchestrator {
    let clusters = Arc::new(ConfiguredClusters::from_config(&config.clusters));
    snapcadence::open_orchestrator(config, Arc::new(ManualCronEngine::new()), clusters).await
}

fn fmt_time(t: Option<chrono::DateTime<chrono::Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_task(task: &ScheduledTask) {
    println!("ID:         {}", task.id);
    println!("Name:       {}", task.name);
    println!("Volume:     {}/{}", task.namespace, task.source_volume_name);
    println!("Class:      {}", task.snapshot_class_name);
    println!("Cron:       {}", task.cron_expression);
    println!("Enabled:    {}", task.enabled);
    if task.target_clusters.is_empty() {
        println!("Targets:    (current cluster)");
    } else {
        println!("Targets:    {}", task.target_clusters.join(", "));
    }
    println!("Created:    {} by {}", fmt_time(Some(task.created_at)), task.created_by);
    println!("Last run:   {}", fmt_time(task.last_executed));
    println!("Next run:   {}", fmt_time(task.next_execution));
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = {
        let _bootstrap = bootstrap_tracing();
        AppConfig::resolve(cli.config.as_deref())?
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve => {
            tracing::info!("Starting snapcadence daemon");
            snapcadence::serve(config).await?;
        }
        Commands::Task { action } => {
            let orchestrator = offline_orchestrator(&config).await;

            match action {
                TaskAction::List { json } => {
                    let tasks = orchestrator.list_tasks().await;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&tasks)?);
                    } else if tasks.is_empty() {
                        println!("No tasks found.");
                    } else {
                        println!(
                            "{:<32} | {:<15} | {:<7} | {:<19} | Next run",
                            "ID", "Cron", "Enabled", "Last run"
                        );
                        println!("{:-<32}-|-{:-<15}-|-{:-<7}-|-{:-<19}-|-{:-<19}", "", "", "", "", "");
                        for t in tasks {
                            println!(
                                "{:<32} | {:<15} | {:<7} | {:<19} | {}",
                                t.id,
                                t.cron_expression,
                                t.enabled,
                                fmt_time(t.last_executed),
                                fmt_time(t.next_execution)
                            );
                        }
                    }
                }
                TaskAction::Show { id } => {
                    let task = orchestrator.get_task(&id).await?;
                    print_task(&task);
                    let status = orchestrator.status(&id).await?;
                    if let Some(err) = status.error_message {
                        println!("Last error: {}", err);
                    }
                }
                TaskAction::Add {
                    name,
                    namespace,
                    volume,
                    snapshot_class,
                    cron,
                    targets,
                    created_by,
                } => {
                    let def = TaskDefinition {
                        name,
                        namespace,
                        source_volume_name: volume,
                        snapshot_class_name: snapshot_class,
                        cron_expression: cron,
                        enabled: None,
                        target_clusters: targets,
                    };
                    let created_by = created_by
                        .or_else(|| std::env::var("USER").ok())
                        .unwrap_or_else(|| "cli".to_string());
                    let task = orchestrator.create_task(def, &created_by).await?;
                    println!("Task '{}' added.", task.id);
                    println!("Next run: {}", fmt_time(task.next_execution));
                }
                TaskAction::Update {
                    id,
                    name,
                    namespace,
                    volume,
                    snapshot_class,
                    cron,
                    targets,
                    clear_targets,
                    enabled,
                } => {
                    let current = orchestrator.get_task(&id).await?;
                    let target_clusters = if clear_targets {
                        Vec::new()
                    } else {
                        targets.unwrap_or(current.target_clusters)
                    };
                    let def = TaskDefinition {
                        name: name.unwrap_or(current.name),
                        namespace: namespace.unwrap_or(current.namespace),
                        source_volume_name: volume.unwrap_or(current.source_volume_name),
                        snapshot_class_name: snapshot_class.unwrap_or(current.snapshot_class_name),
                        cron_expression: cron.unwrap_or(current.cron_expression),
                        enabled,
                        target_clusters,
                    };
                    let task = orchestrator.update_task(&id, def).await?;
                    println!("Task '{}' updated.", task.id);
                }
                TaskAction::Toggle { id } => {
                    let task = orchestrator.toggle_task(&id).await?;
                    let state = if task.enabled { "enabled" } else { "disabled" };
                    println!("Task '{}' {}.", task.id, state);
                }
                TaskAction::Remove { id } => {
                    orchestrator.delete_task(&id).await?;
                    println!("Task '{}' removed.", id);
                }
                TaskAction::Run { id } => {
                    let record = orchestrator.run_now(&id).await?;
                    println!("Snapshot {}: {:?}", record.snapshot_name, record.status);
                    for outcome in &record.outcomes {
                        match (&outcome.snapshot, &outcome.error) {
                            (_, Some(err)) => println!(" - {}: FAILED ({})", outcome.cluster, err),
                            (Some(name), None) => println!(" - {}: created {}", outcome.cluster, name),
                            (None, None) => println!(" - {}: no result", outcome.cluster),
                        }
                    }
                }
                TaskAction::DryRun { hours } => {
                    let preview = orchestrator.preview(hours).await;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for run in preview {
                            println!("{} : {} ({})", fmt_time(Some(run.at)), run.task_name, run.task_id);
                        }
                    }
                }
            }
        }
        Commands::Cron { action } => match action {
            CronAction::Check { expression, count } => {
                let schedule = scheduler::parse(&expression)
                    .with_context(|| format!("invalid cron expression '{}'", expression))?;
                println!("'{}' is valid. Next {} fire times (UTC):", schedule, count);
                let mut from = chrono::Utc::now();
                for _ in 0..count {
                    match schedule.next_after(from) {
                        Some(next) => {
                            println!("  {}", fmt_time(Some(next)));
                            from = next;
                        }
                        None => break,
                    }
                }
            }
        },
        Commands::Clusters { action } => match action {
            ClustersAction::List => {
                let clusters = ConfiguredClusters::from_config(&config.clusters);
                let current = clusters.current_cluster_name();
                println!("{:<1} {:<20} | {:<24} | {:<8} | Description", "", "Name", "Display name", "Status");
                println!("{:-<22}-|-{:-<24}-|-{:-<8}-|-{:-<24}", "", "", "", "");
                for c in clusters.clusters() {
                    let marker = if c.name == current { "*" } else { "" };
                    println!(
                        "{:<1} {:<20} | {:<24} | {:<8} | {}",
                        marker, c.name, c.display_name, c.status.to_string(), c.description
                    );
                }
            }
        },
    }

    Ok(())
}

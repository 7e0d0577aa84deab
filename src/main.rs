use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use clap::Parser;
use history_compactor::{
    cluster::{ClusterLifecycle, InstanceSettings},
    compaction::{CompactionScheduler, SystemClock},
    config::CompactorConfig,
    db::DbPool,
    observability,
};

/// How long shutdown waits for a running cycle to reach a workflow boundary.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version, about = "Workflow history compactor", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults and WORKFLOW_HISTORY_COMPACTING_* variables
    /// are used when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Compact on a timer while this instance is leader (default)
    Serve,
    /// Run a single compaction cycle now and print its report as JSON
    ///
    /// Ignores the instance role. Respects `dry_run`.
    Compact,
    /// Run database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability.logging) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match args.command {
        Some(Command::Migrate) => run_migrate(&config).await,
        Some(Command::Compact) => run_compact(config).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<CompactorConfig, String> {
    match path {
        Some(path) => CompactorConfig::from_file(path)
            .map_err(|e| format!("Failed to load config from {}: {e}", path.display())),
        None => CompactorConfig::from_env().map_err(|e| format!("Invalid configuration: {e}")),
    }
}

/// Connect, then apply or verify migrations so the readiness flag is set.
async fn connect(config: &CompactorConfig) -> Option<DbPool> {
    if config.database.is_none() {
        tracing::error!("Database is not configured");
        return None;
    }

    let db = match DbPool::from_config(&config.database).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            return None;
        }
    };

    if config.database.run_migrations() {
        if let Err(e) = db.run_migrations().await {
            tracing::error!(error = %e, "Database migrations failed");
            return None;
        }
        tracing::info!("Database migrations completed successfully");
    } else {
        // A schema that is behind leaves the scheduler idle rather than failing
        if let Err(e) = db.verify_migrations().await {
            tracing::warn!(error = %e, "Failed to verify database migrations");
        }
    }

    Some(db)
}

fn scheduler_for(
    config: &CompactorConfig,
    db: &DbPool,
    settings: Arc<InstanceSettings>,
) -> CompactionScheduler {
    CompactionScheduler::new(
        db.workflow_history(),
        Arc::new(SystemClock),
        config.compaction.clone(),
        settings,
        db.connection_state(),
    )
}

async fn run_server(config: CompactorConfig) -> ExitCode {
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::error!(error = %e, "Failed to initialize metrics");
        return ExitCode::FAILURE;
    }

    let Some(db) = connect(&config).await else {
        return ExitCode::FAILURE;
    };

    let settings = Arc::new(InstanceSettings::from_config(&config.instance));
    let lifecycle = ClusterLifecycle::new(Arc::clone(&settings));
    let scheduler = scheduler_for(&config, &db, settings);
    scheduler.register(&lifecycle);

    if let Err(e) = scheduler.init() {
        tracing::error!(error = %e, "Failed to start compaction scheduler");
        return ExitCode::FAILURE;
    }

    tracing::info!(
        instance_type = %config.instance.instance_type,
        role = %config.instance.role,
        state = ?scheduler.state(),
        "History compactor running"
    );

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, waiting for running cycle to stop...");
    lifecycle.shutdown();

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler.wait_for_cycles()).await {
        Ok(()) => tracing::info!("Shutdown complete"),
        Err(_) => tracing::warn!("Timeout waiting for compaction cycle to stop"),
    }
    ExitCode::SUCCESS
}

async fn run_compact(config: CompactorConfig) -> ExitCode {
    let Some(db) = connect(&config).await else {
        return ExitCode::FAILURE;
    };

    let settings = Arc::new(InstanceSettings::from_config(&config.instance));
    let scheduler = scheduler_for(&config, &db, settings);

    let Some(report) = scheduler.compact_now().await else {
        tracing::error!("A compaction cycle is already running");
        return ExitCode::FAILURE;
    };

    match serde_json::to_string_pretty(&report) {
        Ok(json) => {
            println!("{json}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize cycle report");
            ExitCode::FAILURE
        }
    }
}

async fn run_migrate(config: &CompactorConfig) -> ExitCode {
    if config.database.is_none() {
        eprintln!("Error: Database is not configured. Nothing to migrate.");
        return ExitCode::FAILURE;
    }

    tracing::info!("Running database migrations");
    match DbPool::from_config(&config.database).await {
        Ok(pool) => match pool.run_migrations().await {
            Ok(()) => {
                tracing::info!("Database migrations completed successfully");
                ExitCode::SUCCESS
            }
            Err(e) => {
                tracing::error!(error = %e, "Database migrations failed");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "Failed to connect to database");
            ExitCode::FAILURE
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

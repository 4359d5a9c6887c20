//! `optd`: the controller/supervisor scheduling plane's CLI binary
//! (`SPEC_FULL.md` §10.5).

mod serve_cmd;
mod status_cmd;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use optd_broker::Broker;
use optd_core::config::{AppConfig, BrokerSection, ConfigFile, DatabaseSection, HandoffSection};
use optd_core::ingest;
use optd_db::pool;
use optd_db::thresholds::Thresholds;

#[derive(Parser)]
#[command(name = "optd", version, about = "Controller/supervisor scheduling plane for distributed optimization jobs")]
struct Cli {
    /// Override the Store DSN resolved from env/config.
    #[arg(long, global = true)]
    db_url: Option<String>,

    /// Override the Broker URL resolved from env/config.
    #[arg(long, global = true)]
    broker_url: Option<String>,

    /// Override the ingestion handoff directory resolved from env/config.
    #[arg(long, global = true)]
    handoff_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending Store migrations, creating the database if needed.
    DbInit,
    /// Scaffold a config file at the XDG config path.
    Init,
    /// Run the Scheduler, Watchdog, Auto-Reoptimizer, and leadership loops.
    Serve,
    /// Manually ingest a single `.set` file via its sidecar contract.
    Ingest {
        /// Path to the `.set` file; its sidecar is expected alongside it.
        file: PathBuf,
    },
    /// Print aggregate job/task counts by status.
    Status {
        /// Restrict to one job's task counts instead of the fleet-wide totals.
        #[arg(long)]
        job: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::resolve(cli.db_url.as_deref(), cli.broker_url.as_deref(), cli.handoff_dir.as_deref());

    match cli.command {
        Commands::DbInit => cmd_db_init(&config).await,
        Commands::Init => cmd_init(&config),
        Commands::Serve => cmd_serve(&config).await,
        Commands::Ingest { file } => cmd_ingest(&config, &file).await,
        Commands::Status { job } => cmd_status(&config, job.as_deref()).await,
    }
}

async fn cmd_db_init(config: &AppConfig) -> Result<()> {
    pool::ensure_database_exists(&config.db).await.context("failed to ensure database exists")?;

    let pg_pool = pool::create_pool(&config.db).await.context("failed to connect to database")?;
    pool::run_migrations(&pg_pool).await.context("failed to run migrations")?;

    let counts = pool::table_counts(&pg_pool).await.context("failed to read table counts")?;
    println!("Database ready: {}", config.db.database_name().unwrap_or("?"));
    for (table, count) in counts {
        println!("  {table}: {count} rows");
    }

    pg_pool.close().await;
    Ok(())
}

fn cmd_init(config: &AppConfig) -> Result<()> {
    let path = optd_core::config::config_path();
    if path.exists() {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: config.db.database_url.clone(),
        },
        broker: BrokerSection {
            url: config.broker.redis_url.clone(),
        },
        handoff: HandoffSection {
            dir: config.handoff_dir.display().to_string(),
        },
    };
    optd_core::config::save_config(&file).context("failed to write config file")?;
    println!("Wrote config to {}", path.display());
    Ok(())
}

async fn cmd_serve(config: &AppConfig) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db).await.context("failed to connect to database")?;
    let broker = Broker::connect(config.broker.clone()).await.context("failed to connect to broker")?;

    tokio::fs::create_dir_all(&config.handoff_dir)
        .await
        .with_context(|| format!("failed to create handoff directory {}", config.handoff_dir.display()))?;

    serve_cmd::run_serve(pg_pool, broker, config.handoff_dir.clone()).await
}

async fn cmd_ingest(config: &AppConfig, file: &PathBuf) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db).await.context("failed to connect to database")?;
    let thresholds = Thresholds::from_env();
    let notifier = optd_core::notifier::CompositeNotifier::from_env();

    let handoff_dir = file.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    let outcome = ingest::ingest_file(&pg_pool, &thresholds, &notifier, &handoff_dir, file)
        .await
        .context("ingestion failed")?;

    match outcome {
        ingest::IngestOutcome::Created { job_id, task_id } => {
            println!("Created job {job_id}, task {task_id}");
        }
        ingest::IngestOutcome::Rejected { reason } => {
            println!("Rejected: {reason}");
        }
    }

    pg_pool.close().await;
    Ok(())
}

async fn cmd_status(config: &AppConfig, job_id: Option<&str>) -> Result<()> {
    let pg_pool = pool::create_pool(&config.db).await.context("failed to connect to database")?;
    status_cmd::run_status(&pg_pool, job_id).await?;
    pg_pool.close().await;
    Ok(())
}

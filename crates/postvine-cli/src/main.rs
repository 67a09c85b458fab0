use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use postvine_queue::RedisQueue;
use postvine_storage::PgStore;
use postvine_sync::{IngestPipeline, WorkerConfig};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "postvine")]
#[command(about = "PostVine social post ingestion worker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the ingestion worker (default).
    Run,
    /// Apply database migrations and exit.
    Migrate,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = WorkerConfig::from_env();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Run => {
            let handle = postvine_web::init_metrics();
            postvine_sync::describe_metrics();
            let metrics_port = config.metrics_port;
            tokio::spawn(async move {
                if let Err(err) = postvine_web::serve(metrics_port, handle).await {
                    error!(error = %err, "metrics server exited");
                }
            });

            let store = PgStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to Postgres")?;
            store.migrate().await.context("running migrations")?;
            let queue = RedisQueue::connect(&config.redis_url, config.redis_key.clone())
                .await
                .context("connecting to Redis")?;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => info!("interrupt received; shutting down after the current cycle"),
                    Err(err) => {
                        error!(error = %err, "cannot listen for interrupts; shutting down")
                    }
                }
                let _ = shutdown_tx.send(true);
            });

            info!(
                queue_key = %config.redis_key,
                records_per_pull = config.records_per_pull,
                "worker starting"
            );
            let pipeline = IngestPipeline::new(queue, store, config.records_per_pull);
            pipeline.run(shutdown_rx).await;
            info!("worker stopped");
        }
    }

    Ok(())
}

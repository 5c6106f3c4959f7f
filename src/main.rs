// ABOUTME: CLI entry point for pg-pubsub
// ABOUTME: Parses commands and routes to engine operations

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};

use pg_pubsub::registry::{ChangeHandler, FailureSink, HandlerRegistration};
use pg_pubsub::{PubSub, PubSubConfig, ReconcileStrategy, TableChanges};

#[derive(Parser)]
#[command(name = "pg-pubsub")]
#[command(about = "PostgreSQL change-data-capture and pub/sub engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct ConnectionArgs {
    /// PostgreSQL connection string (falls back to DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Schema of the watched tables and generated triggers
    #[arg(long, default_value = "public")]
    schema: String,
    /// Prefix for generated trigger functions; also the NOTIFY channel
    #[arg(long, default_value = "pubsub_trigger")]
    prefix: String,
    /// Queue table name
    #[arg(long, default_value = "pg_pubsub_queue")]
    queue_table: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch tables and log every change event until interrupted
    Serve {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Tables to watch (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Use the transactional full-replace reconciliation strategy
        #[arg(long)]
        atomic_reconcile: bool,
    },
    /// Reconcile triggers for the given tables and exit
    InstallTriggers {
        #[command(flatten)]
        connection: ConnectionArgs,
        /// Tables to capture (comma-separated)
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
        /// Use the transactional full-replace reconciliation strategy
        #[arg(long)]
        atomic_reconcile: bool,
    },
    /// Show queue row counts per status
    Status {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Delete processed and retry-exhausted rows past their TTL
    Cleanup {
        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

/// Handler used by `serve`: logs every delivered change.
struct LoggingHandler;

#[async_trait]
impl ChangeHandler for LoggingHandler {
    async fn process(&self, changes: &TableChanges, _failures: &FailureSink) -> Result<()> {
        for message in &changes.all {
            tracing::info!(
                "{} on {}.{} (queue id {}): {}",
                message.event.as_sql(),
                message.schema,
                message.table,
                message.id,
                serde_json::to_string(message.data.row()).unwrap_or_default()
            );
        }
        Ok(())
    }
}

fn build_config(connection: &ConnectionArgs, atomic_reconcile: bool) -> PubSubConfig {
    let mut config = PubSubConfig::new(connection.database_url.clone());
    config.trigger_schema = connection.schema.clone();
    config.trigger_prefix = connection.prefix.clone();
    config.queue_schema = connection.schema.clone();
    config.queue_table = connection.queue_table.clone();
    if atomic_reconcile {
        config.reconcile_strategy = ReconcileStrategy::AtomicReplace;
    }
    config
}

fn register_tables(pubsub: &mut PubSub, tables: &[String]) -> Result<()> {
    if tables.is_empty() {
        bail!("At least one table is required (use --tables)");
    }
    for table in tables {
        pubsub.register(HandlerRegistration::new(
            table.clone(),
            Arc::new(LoggingHandler),
        ));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over the --log flag.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Serve {
            connection,
            tables,
            atomic_reconcile,
        } => {
            let config = build_config(&connection, atomic_reconcile);
            let mut pubsub = PubSub::new(config);
            register_tables(&mut pubsub, &tables)?;

            let handle = pubsub.start().await?;
            tracing::info!("Watching {} table(s); press ctrl-c to stop", tables.len());

            tokio::signal::ctrl_c()
                .await
                .context("Failed to wait for ctrl-c")?;
            handle.shutdown().await
        }
        Commands::InstallTriggers {
            connection,
            tables,
            atomic_reconcile,
        } => {
            let config = build_config(&connection, atomic_reconcile);
            let mut pubsub = PubSub::new(config);
            register_tables(&mut pubsub, &tables)?;

            match pubsub.install_triggers().await? {
                Some(summary) => {
                    println!(
                        "Triggers reconciled: {} installed, {} dropped",
                        summary.installed, summary.dropped
                    );
                }
                None => {
                    println!("Another instance is already updating PubSub triggers");
                }
            }
            Ok(())
        }
        Commands::Status { connection } => {
            let config = build_config(&connection, false);
            config.validate()?;
            let client =
                Arc::new(pg_pubsub::postgres::connect_with_retry(&config.database_url).await?);
            let queue = pg_pubsub::queue::QueueService::new(client, &config);
            let stats = queue.stats().await?;
            println!("pending:    {}", stats.pending);
            println!("processing: {}", stats.processing);
            println!("processed:  {}", stats.processed);
            println!("failed:     {}", stats.failed);
            println!("total:      {}", stats.total());
            Ok(())
        }
        Commands::Cleanup { connection } => {
            let config = build_config(&connection, false);
            config.validate()?;
            let client =
                Arc::new(pg_pubsub::postgres::connect_with_retry(&config.database_url).await?);
            let queue = pg_pubsub::queue::QueueService::new(client, &config);
            let deleted = queue.cleanup().await?;
            println!("Deleted {} row(s)", deleted);
            Ok(())
        }
    }
}

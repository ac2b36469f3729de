use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tunedw")]
#[command(about = "Artist popularity warehouse sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one discover, enrich and reconcile pass.
    Sync {
        /// Collect and print the batch as JSON without writing to the warehouse.
        #[arg(long)]
        dry_run: bool,
    },
    /// Run on the SYNC_CRON schedule until interrupted.
    Schedule,
    /// Create the target table if it does not exist.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .context("installing tracing subscriber")?;

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run: true } => {
            let batch = tunedw_sync::dry_run_from_env().await?;
            info!(run_id = %batch.run_id, records = batch.len(), "dry run collected batch");
            println!(
                "{}",
                serde_json::to_string_pretty(&batch).context("serializing batch")?
            );
        }
        Commands::Sync { dry_run: false } => {
            let summary = tunedw_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} records={} inserted={} updated={} duplicates_dropped={}",
                summary.run_id,
                summary.records,
                summary.inserted,
                summary.updated,
                summary.duplicates_dropped
            );
        }
        Commands::Schedule => tunedw_sync::run_scheduler_from_env().await?,
        Commands::Migrate => {
            let table = tunedw_sync::migrate_from_env().await?;
            println!("migrate complete: table={table}");
        }
    }

    Ok(())
}

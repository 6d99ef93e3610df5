use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scrip_storage::CheckpointStore;
use scrip_sync::{Pipeline, Planned, RunConfig};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "scrip")]
#[command(about = "Sharded, checkpointed scrape-ingest pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process this shard's pending rows.
    Run {
        /// Keep records in memory instead of writing to the configured sink.
        #[arg(long)]
        dry_run: bool,
    },
    /// Show what a run would process, without retrieving anything.
    Plan {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Create the MySQL sink table.
    Migrate,
}

#[derive(Debug, Subcommand)]
enum CheckpointAction {
    Show,
    /// Forget this shard's progress.
    Reset,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight items");
            token.cancel();
        }
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { dry_run: false }) {
        Commands::Run { dry_run } => {
            let summary = scrip_sync::run_from_env(dry_run, cancel_on_ctrl_c()).await?;
            println!(
                "run complete: run_id={} shard={}/{} planned={} {} checkpoint={}->{}{} report={}",
                summary.run_id,
                summary.shard.index,
                summary.shard.step,
                summary.planned,
                summary.counters,
                summary.checkpoint_before,
                summary.checkpoint_after,
                if summary.cancelled { " (cancelled)" } else { "" },
                summary.report_path
            );
        }
        Commands::Plan { limit } => {
            let pipeline = Pipeline::from_env()?;
            let checkpoint = pipeline.open_checkpoint().await.current().await;
            let prepared = pipeline.prepare(checkpoint).await?;
            println!(
                "shard={}/{} checkpoint={} rows={} references={} planned={} ready={} malformed={}",
                pipeline.run_config().shard.index,
                pipeline.run_config().shard.step,
                prepared.checkpoint,
                prepared.primary_rows,
                prepared.reference_size,
                prepared.plan.len(),
                prepared.plan.ready_count(),
                prepared.plan.malformed_count()
            );
            for entry in prepared.plan.entries.iter().take(limit) {
                match entry {
                    Planned::Ready(item) => println!(
                        "  {:>6} {:<12} {} {}",
                        item.index,
                        item.subject_key,
                        item.aux_date.as_deref().unwrap_or("-"),
                        item.target
                    ),
                    Planned::Malformed { index, subject, reason } => {
                        println!("  {index:>6} {subject:<12} malformed: {reason}")
                    }
                }
            }
        }
        Commands::Checkpoint { action } => {
            let config = RunConfig::from_env().context("invalid run configuration")?;
            match action {
                CheckpointAction::Show => {
                    let value = CheckpointStore::read_value(&config.checkpoint_file).await;
                    println!("{} = {value}", config.checkpoint_file.display());
                }
                CheckpointAction::Reset => {
                    CheckpointStore::open(&config.checkpoint_file).await.reset().await?;
                    println!("{} reset", config.checkpoint_file.display());
                }
            }
        }
        Commands::Migrate => {
            let pipeline = Pipeline::from_env()?;
            let table = pipeline.migrate().await?;
            println!("table `{table}` ready");
        }
    }

    Ok(())
}

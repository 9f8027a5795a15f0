/// fitsync CLI
///
/// Logs sets and manages divisions against the local store, and syncs them
/// with the remote store when one is configured. Without `--url` every write
/// stays local until a later run with connectivity.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use fitsync_core::history::{max_weight_by_day, summarize_sessions};
use fitsync_core::{NewSet, Split, Store};
use fitsync_sync::{
    CacheQuery, ConnectivityObserver, DivisionDraft, FitnessTracker, HttpRemote, MemoryRemote,
    RemoteStore, SyncEngineBuilder, SyncOutcome,
};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod table;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OutputFormat {
    /// Table format (default)
    Table,
    /// Pretty JSON
    Json,
}

#[derive(Parser)]
#[command(name = "fitsync")]
#[command(about = "Offline-first workout tracker", long_about = None)]
struct Cli {
    /// Local store directory
    #[arg(long, default_value = "fitsync-data")]
    db: PathBuf,

    /// Remote store base URL; omit to work offline
    #[arg(long, env = "FITSYNC_URL")]
    url: Option<String>,

    /// Remote store API key
    #[arg(long, env = "FITSYNC_API_KEY", default_value = "")]
    api_key: String,

    /// Access token of the signed-in user
    #[arg(long, env = "FITSYNC_TOKEN")]
    token: Option<String>,

    /// Owner identity for remote rows
    #[arg(long, env = "FITSYNC_OWNER")]
    owner: String,

    /// Output format (table, json)
    #[arg(short, long, value_enum, default_value = "table", global = true)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log one set
    Log {
        #[arg(long)]
        workout: String,
        #[arg(long)]
        split: String,
        #[arg(long)]
        exercise: String,
        #[arg(long)]
        weight: f64,
        #[arg(long)]
        reps: u32,
    },
    /// List sets not yet confirmed by the remote store
    Pending,
    /// Show sync state and statistics
    Status,
    /// Division operations
    Division {
        #[command(subcommand)]
        command: DivisionCommands,
    },
    /// Show past sessions, or the daily max weight of one exercise
    History {
        #[arg(long)]
        exercise: Option<String>,
    },
    /// Run a sync pass
    Sync {
        /// Keep syncing on the configured interval until interrupted
        #[arg(long)]
        watch: bool,
        /// Sync interval in seconds (for --watch)
        #[arg(long, default_value = "30")]
        interval: u64,
    },
}

#[derive(Subcommand)]
enum DivisionCommands {
    /// Create a division with its splits in training order
    Create {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        frequency: String,
        /// Split name, repeat for each split
        #[arg(long = "split")]
        splits: Vec<String>,
    },
    /// List divisions with their splits
    List,
    /// Delete a division
    Delete { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Default to info, override with RUST_LOG
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let interval = match &cli.command {
        Commands::Sync { interval, .. } => Duration::from_secs(*interval),
        _ => Duration::from_secs(30),
    };
    let tracker = open_tracker(&cli, interval)?;
    let output = cli.output;

    match cli.command {
        Commands::Log {
            workout,
            split,
            exercise,
            weight,
            reps,
        } => {
            let log = tracker
                .log_set(NewSet {
                    workout_id: workout,
                    split_id: split,
                    exercise_id: exercise,
                    weight,
                    reps,
                })
                .context("Failed to log set")?;

            // Submit before exit instead of leaving it to the background pass
            if tracker.engine().is_online() {
                match tracker.engine().sync_now().await {
                    Ok(SyncOutcome::Coalesced) => tracker.engine().wait_idle().await,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "set kept locally, sync failed"),
                }
            }
            let log = tracker
                .all_logs()?
                .into_iter()
                .find(|l| l.local_id == log.local_id)
                .unwrap_or(log);

            match output {
                OutputFormat::Table => println!("{}", table::format_logs_table(&[log])),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&log)?),
            }
        }

        Commands::Pending => {
            let logs = tracker.pending_logs()?;
            match output {
                OutputFormat::Table => {
                    println!("{}", table::format_logs_table(&logs));
                    println!();
                    println!("Pending: {}", logs.len());
                }
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&logs)?),
            }
        }

        Commands::Status => {
            let engine = tracker.engine();
            let pending = engine.pending_logs()?.len();
            let queued = engine.division_queue().list()?;
            match output {
                OutputFormat::Table => {
                    println!("Status: {}", engine.status());
                    println!("Pending sets: {}", pending);
                    println!("Queued divisions: {}", queued.len());
                    for entry in &queued {
                        println!(
                            "  {} ({}) attempts={} last_error={}",
                            entry.division.name,
                            entry.id,
                            entry.attempts,
                            entry.last_error.as_deref().unwrap_or("-")
                        );
                    }
                    println!();
                    println!("{}", table::format_stats_table(&engine.stats()));
                }
                OutputFormat::Json => {
                    let status = json!({
                        "status": engine.status(),
                        "online": engine.is_online(),
                        "pending_logs": pending,
                        "queued_divisions": queued,
                        "stats": engine.stats(),
                    });
                    println!("{}", serde_json::to_string_pretty(&status)?);
                }
            }
        }

        Commands::Division { command } => handle_division_command(&tracker, command, output).await?,

        Commands::History { exercise } => {
            let logs = tracker.all_logs()?;
            match (exercise, output) {
                (Some(exercise), OutputFormat::Table) => {
                    for day in max_weight_by_day(&logs, &exercise) {
                        println!("{}  {:.1}", day.date, day.max_weight);
                    }
                }
                (Some(exercise), OutputFormat::Json) => {
                    let days = max_weight_by_day(&logs, &exercise);
                    println!("{}", serde_json::to_string_pretty(&days)?);
                }
                (None, OutputFormat::Table) => {
                    println!("{}", table::format_sessions_table(&summarize_sessions(&logs)));
                }
                (None, OutputFormat::Json) => {
                    let sessions = summarize_sessions(&logs);
                    println!("{}", serde_json::to_string_pretty(&sessions)?);
                }
            }
        }

        Commands::Sync { watch, .. } => {
            let engine = tracker.engine();
            if !engine.is_online() {
                anyhow::bail!("No remote store configured. Pass --url or set FITSYNC_URL.");
            }

            if watch {
                let observer = ConnectivityObserver::new(true);
                engine.start(&observer).await?;
                println!("Syncing every {}s, Ctrl-C to stop", interval.as_secs());
                tokio::signal::ctrl_c().await?;
                engine.stop().await?;
                engine.wait_idle().await;
            } else {
                match engine.sync_now().await? {
                    SyncOutcome::Completed(report) => match output {
                        OutputFormat::Table => {
                            println!("Logs synced: {}", report.logs_synced);
                            println!("Logs held back: {}", report.logs_held_back);
                            println!("Divisions created: {}", report.divisions_created);
                            println!("Divisions still queued: {}", report.divisions_pending);
                            for error in &report.errors {
                                println!("✗ {}", error);
                            }
                        }
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&report)?)
                        }
                    },
                    SyncOutcome::Coalesced => {
                        engine.wait_idle().await;
                        println!("Another sync pass was running; it has finished");
                    }
                    SyncOutcome::Offline => println!("Offline, nothing attempted"),
                }
            }
            println!("Status: {}", engine.status());
        }
    }

    Ok(())
}

fn open_tracker(cli: &Cli, interval: Duration) -> Result<FitnessTracker> {
    let store = Store::open(&cli.db)
        .with_context(|| format!("Failed to open local store at {}", cli.db.display()))?;

    let (remote, online): (Arc<dyn RemoteStore>, bool) = match &cli.url {
        Some(url) => {
            let mut remote =
                HttpRemote::new(url.clone(), cli.api_key.clone()).context("Invalid remote store URL")?;
            if let Some(token) = &cli.token {
                remote = remote.with_access_token(token.clone());
            }
            (Arc::new(remote), true)
        }
        None => {
            tracing::info!("no remote store configured, working offline");
            let remote = MemoryRemote::new();
            remote.set_reachable(false);
            (Arc::new(remote), false)
        }
    };

    let engine = SyncEngineBuilder::new()
        .with_store(Arc::new(store))
        .with_remote(remote)
        .with_owner(cli.owner.clone())
        .with_sync_interval(interval)
        .with_client_ref(online)
        .build()?;
    engine.set_online(online);

    Ok(FitnessTracker::new(engine))
}

async fn handle_division_command(
    tracker: &FitnessTracker,
    command: DivisionCommands,
    output: OutputFormat,
) -> Result<()> {
    match command {
        DivisionCommands::Create {
            name,
            frequency,
            splits,
        } => {
            let created = tracker
                .create_division(DivisionDraft {
                    name,
                    frequency,
                    splits,
                })
                .await
                .context("Failed to create division")?;

            match output {
                OutputFormat::Table => {
                    let queued = if created.is_queued() {
                        vec![created.division().id.clone()]
                    } else {
                        Vec::new()
                    };
                    let rows = vec![(created.division().clone(), created.splits().to_vec())];
                    println!("{}", table::format_divisions_table(&rows, &queued));
                    if created.is_queued() {
                        println!("Queued, will be created on the next sync");
                    }
                }
                OutputFormat::Json => {
                    let value = json!({
                        "queued": created.is_queued(),
                        "division": created.division(),
                        "splits": created.splits(),
                    });
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
            }
        }

        DivisionCommands::List => {
            let loaded = tracker.divisions().await?;
            let mut divisions = loaded.rows;

            // Show the refreshed copy when the remote store answers
            if tracker.engine().is_online() {
                match loaded.refresh.await {
                    Ok(Ok(_)) => {
                        divisions = tracker.loader().local(
                            &CacheQuery::eq("owner_id", tracker.engine().config().owner_id.as_str())
                                .order_by("created_at"),
                        )?;
                    }
                    Ok(Err(e)) => tracing::warn!(error = %e, "showing local divisions only"),
                    Err(e) => tracing::warn!(error = %e, "division refresh task failed"),
                }
            }

            let mut rows = Vec::with_capacity(divisions.len());
            for division in divisions {
                let splits = tracker.loader().local::<Split>(
                    &CacheQuery::eq("division_id", &division.id).order_by("order_index"),
                )?;
                rows.push((division, splits));
            }
            let queued: Vec<String> = tracker
                .engine()
                .division_queue()
                .list()?
                .into_iter()
                .map(|entry| entry.id)
                .collect();

            match output {
                OutputFormat::Table => println!("{}", table::format_divisions_table(&rows, &queued)),
                OutputFormat::Json => {
                    let value: Vec<_> = rows
                        .iter()
                        .map(|(division, splits)| {
                            json!({
                                "division": division,
                                "splits": splits,
                                "queued": queued.contains(&division.id),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&value)?);
                }
            }
        }

        DivisionCommands::Delete { id } => {
            tracker
                .delete_division(&id)
                .await
                .with_context(|| format!("Failed to delete division {}", id))?;
            println!("✓ Division deleted");
        }
    }

    Ok(())
}
